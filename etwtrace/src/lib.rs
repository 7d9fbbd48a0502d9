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

//! # etwtrace
//!
//! A safe consumer for Event Tracing for Windows (ETW).
//!
//! The crate models a trace session as a [`Trace`] parameterized by a
//! [`TraceKind`]: [`UserTrace`] consumes manifest-based user providers,
//! [`KernelTrace`] consumes the NT kernel logger. Providers are declared
//! with the [`Provider`] and [`KernelProvider`] builders, events arrive
//! on the processing thread as borrowed [`EventRecord`]s, and every
//! privileged call goes through the [`TraceSubsystem`] trait so session
//! logic stays testable off-platform (see [`testing`]).
//!
//! ```no_run
//! use etwtrace::{Guid, Provider, UserTrace};
//!
//! # fn main() -> Result<(), etwtrace::TraceError> {
//! let id = Guid::try_parse("a0c1853b-5c40-4b15-8766-3cf1c58f985a").unwrap();
//! let provider = Provider::new(id)
//!     .any(0x10)
//!     .add_callback(|record| {
//!         println!("event {} from pid {}", record.event_id(), record.process_id());
//!     });
//!
//! let trace = UserTrace::new("my-session");
//! trace.enable(provider)?;
//! trace.start()?; // blocks until stop() is called from another thread
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub(crate) mod dispatch;
mod error;
mod filter;
mod guid;
mod provider;
mod record;
mod session;
mod subsystem;
pub mod testing;
mod trace;

pub use dispatch::{KernelMode, SYSTEM_TRACE_CONTROL, TraceKind, UserMode, kernel_guids};
pub use error::TraceError;
pub use filter::{AssembledPayloadFilter, CompareOp, EventFilter, PayloadPredicate};
pub use guid::Guid;
pub use provider::{
    EnableInfo, EnableProperty, EventCallback, KernelProvider, Provider, Registration,
};
pub use record::EventRecord;
#[cfg(windows)]
pub use subsystem::NativeSubsystem;
pub use subsystem::{TraceInfo, TraceSubsystem, UnsupportedSubsystem};
pub use trace::{KernelTrace, Trace, TraceProperties, TraceStats, UserTrace};

pub use etwtrace_sys as sys;
