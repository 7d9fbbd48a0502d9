// Copyright (C) 2026 The etwtrace Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Watches NT kernel logger process events for five seconds. Requires an
//! elevated console; only one kernel logger session exists per machine.

use etwtrace::{KernelProvider, KernelTrace};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), etwtrace::TraceError> {
    // Opcode 1 is process start, opcode 2 is process end.
    let processes = KernelProvider::process().add_filtered_callback([1, 2], |record| {
        let verb = if record.opcode() == 1 { "started" } else { "exited" };
        println!("process {} {verb}", record.process_id());
    });

    let trace = KernelTrace::new("ignored-the-kernel-logger-name-is-fixed");
    trace.enable(processes)?;

    let stopper = trace.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(5));
        let _ = stopper.stop();
    });

    trace.start()
}
