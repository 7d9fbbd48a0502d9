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

//! Consumes Microsoft-Windows-PowerShell events for ten seconds and prints
//! one line per event, then reports the session counters.

use etwtrace::{EventFilter, Guid, Provider, UserTrace};
use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), etwtrace::TraceError> {
    let powershell = Guid::try_parse("a0c1853b-5c40-4b15-8766-3cf1c58f985a").unwrap();
    let provider = Provider::new(powershell)
        .level(5)
        .any(u64::MAX)
        .add_filter(EventFilter::EventIds {
            ids: BTreeSet::from([7937]),
            filter_in: true,
        })
        .add_callback(|record| {
            println!(
                "event {} v{} from pid {} ({} payload bytes)",
                record.event_id(),
                record.version(),
                record.process_id(),
                record.user_data().len(),
            );
        });

    let trace = UserTrace::new("etwtrace-user-example");
    trace.enable(provider)?;

    let stopper = trace.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(10));
        if let Err(err) = stopper.stop() {
            eprintln!("stop failed: {err}");
        }
    });

    // Blocks on the processing loop until the timer thread stops us.
    trace.start()?;

    let stats = trace.query_stats()?;
    println!(
        "handled {} events, lost {}, {} buffers",
        stats.events_handled, stats.events_lost, stats.buffers_processed,
    );
    Ok(())
}
