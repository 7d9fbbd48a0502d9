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

//! Session registration and lifecycle against the tracing subsystem.
//!
//! [`SessionController`] is a short-lived coordinator built per operation
//! over a trace's locked state. It owns the privileged-call protocol:
//! registration with the two documented recovery paths, opening the
//! processing handle, pumping, teardown and queries.

use crate::error::{check_status, TraceError};
use crate::subsystem::{TraceInfo, TraceSubsystem};
use etwtrace_sys::*;

/// The mutable native-facing half of one trace session: the registration
/// properties block, both subsystem handles and the trampoline context key.
/// Guarded by the owning trace's session mutex.
pub(crate) struct SessionState {
    pub info: TraceInfo,
    pub name: String,
    /// NUL-terminated UTF-16 spelling of `name`, pointed at by control and
    /// open calls.
    pub name_utf16: Vec<u16>,
    /// Capture-file source. When set, the session reads the persisted file
    /// instead of registering for live delivery.
    pub file_source: Option<Vec<u16>>,
    pub registration: TRACEHANDLE,
    pub processing: TRACEHANDLE,
    /// Key into the trampoline registry. Zero while no hooks are installed.
    pub context_key: usize,
    /// Set when the caller took manual control of the lifecycle via
    /// `open()`; a plain `stop()` then becomes a no-op.
    pub non_stoppable: bool,
}

impl SessionState {
    pub fn new(name: String, info: TraceInfo) -> Self {
        let name_utf16 = name.encode_utf16().chain([0]).collect();
        Self {
            info,
            name,
            name_utf16,
            file_source: None,
            registration: INVALID_PROCESSTRACE_HANDLE,
            processing: INVALID_PROCESSTRACE_HANDLE,
            context_key: 0,
            non_stoppable: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registration != INVALID_PROCESSTRACE_HANDLE && self.registration != 0
    }

    pub fn is_open(&self) -> bool {
        self.processing != INVALID_PROCESSTRACE_HANDLE
    }

    /// The handle ControlTrace should address, zero meaning "by name".
    fn control_handle(&self) -> TRACEHANDLE {
        if self.is_registered() { self.registration } else { 0 }
    }
}

pub(crate) struct SessionController<'a> {
    subsystem: &'a dyn TraceSubsystem,
    state: &'a mut SessionState,
}

impl<'a> SessionController<'a> {
    pub fn new(subsystem: &'a dyn TraceSubsystem, state: &'a mut SessionState) -> Self {
        Self { subsystem, state }
    }

    /// Registers the session, recovering from the two documented failure
    /// shapes: a stale session of the same name is stopped and registration
    /// retried once; insufficient privilege degrades to an open/close
    /// reachability probe that leaves the registration handle invalid.
    pub fn register(&mut self) -> Result<(), TraceError> {
        match self.try_start() {
            Ok(()) => Ok(()),
            Err(TraceError::AlreadyExists) => {
                log::debug!(
                    "trace session {:?} already exists, stopping the stale session",
                    self.state.name
                );
                let _ = self.control(EVENT_TRACE_CONTROL_STOP);
                match self.try_start() {
                    Ok(()) => Ok(()),
                    Err(TraceError::AccessDenied | TraceError::InvalidParameter) => self.probe(),
                    Err(err) => Err(err),
                }
            }
            Err(TraceError::AccessDenied) => self.probe(),
            Err(err) => Err(err),
        }
    }

    fn try_start(&mut self) -> Result<(), TraceError> {
        let (status, handle) = self.subsystem.start_trace(&mut self.state.info);
        check_status(status)?;
        self.state.registration = handle;
        Ok(())
    }

    // Validates that the session is reachable without registering it. Used
    // when this process may consume but not control the session.
    fn probe(&mut self) -> Result<(), TraceError> {
        let mut logfile = EVENT_TRACE_LOGFILEW::default();
        logfile.LoggerName = self.state.name_utf16.as_ptr();
        logfile.ProcessTraceMode = PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        let handle = self.subsystem.open_trace(&mut logfile);
        if handle == INVALID_PROCESSTRACE_HANDLE {
            return Err(TraceError::OpenFailure);
        }
        let _ = self.subsystem.close_trace(handle);
        log::warn!(
            "insufficient privilege to control trace session {:?}; consuming without registration",
            self.state.name
        );
        self.state.registration = INVALID_PROCESSTRACE_HANDLE;
        Ok(())
    }

    /// Obtains the processing handle, wiring the fixed trampolines and the
    /// given registry key into the log-file descriptor.
    pub fn open(&mut self, context_key: usize) -> Result<(), TraceError> {
        let mut logfile = EVENT_TRACE_LOGFILEW::default();
        match &self.state.file_source {
            Some(path) => {
                logfile.LogFileName = path.as_ptr();
                logfile.ProcessTraceMode = PROCESS_TRACE_MODE_EVENT_RECORD;
            }
            None => {
                logfile.LoggerName = self.state.name_utf16.as_ptr();
                logfile.ProcessTraceMode =
                    PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
            }
        }
        logfile.EventRecordCallback = Some(crate::subsystem::event_record_trampoline);
        logfile.BufferCallback = Some(crate::subsystem::buffer_trampoline);
        logfile.Context = context_key as *mut core::ffi::c_void;

        let handle = self.subsystem.open_trace(&mut logfile);
        if handle == INVALID_PROCESSTRACE_HANDLE {
            return Err(TraceError::OpenFailure);
        }
        self.state.processing = handle;
        self.state.context_key = context_key;
        Ok(())
    }

    /// Pumps the processing loop on the calling thread until the session is
    /// stopped, the source is exhausted or the subsystem fails. A cancelled
    /// status means the buffer callback asked to stop, which is a normal
    /// return.
    pub fn process(
        &mut self,
        start: Option<FILETIME>,
        end: Option<FILETIME>,
    ) -> Result<(), TraceError> {
        if !self.state.is_open() {
            return Err(TraceError::OpenFailure);
        }
        let status = self.subsystem.process_trace(self.state.processing, start, end);
        match status {
            ERROR_CANCELLED => Ok(()),
            other => check_status(other),
        }
    }

    /// Stops the session and releases the processing handle. Idempotent: a
    /// session the subsystem no longer knows about counts as stopped.
    pub fn stop(&mut self) -> Result<(), TraceError> {
        match self.control(EVENT_TRACE_CONTROL_STOP) {
            Ok(()) | Err(TraceError::Native(ERROR_WMI_INSTANCE_NOT_FOUND)) => {}
            Err(err) => return Err(err),
        }
        self.close()?;
        self.state.registration = INVALID_PROCESSTRACE_HANDLE;
        Ok(())
    }

    /// Releases the processing handle. An asynchronous-teardown status from
    /// the subsystem is acceptable.
    pub fn close(&mut self) -> Result<(), TraceError> {
        if !self.state.is_open() {
            return Ok(());
        }
        let status = self.subsystem.close_trace(self.state.processing);
        self.state.processing = INVALID_PROCESSTRACE_HANDLE;
        match status {
            ERROR_CTX_CLOSE_PENDING => Ok(()),
            other => check_status(other),
        }
    }

    /// Re-applies the buffer configuration to the live session. The session
    /// already being gone is benign: the desired end state holds.
    pub fn update(&mut self) -> Result<(), TraceError> {
        if !self.state.is_registered() {
            return Err(TraceError::NotRegistered);
        }
        match self.control(EVENT_TRACE_CONTROL_UPDATE) {
            Ok(()) | Err(TraceError::Native(ERROR_WMI_INSTANCE_NOT_FOUND)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Forces filled buffers out to the session's consumers. The session
    /// already being gone is benign, as for [`update`](Self::update).
    pub fn flush(&mut self) -> Result<(), TraceError> {
        if !self.state.is_registered() {
            return Err(TraceError::NotRegistered);
        }
        match self.control(EVENT_TRACE_CONTROL_FLUSH) {
            Ok(()) | Err(TraceError::Native(ERROR_WMI_INSTANCE_NOT_FOUND)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Switches a file-sink session to live delivery.
    pub fn transition_to_realtime(&mut self) -> Result<(), TraceError> {
        if !self.state.is_registered() {
            return Err(TraceError::NotRegistered);
        }
        self.control(EVENT_TRACE_CONTROL_CONVERT_TO_REALTIME)
    }

    /// Queries the subsystem's view of the session by name, returning the
    /// filled properties block.
    pub fn query(&mut self) -> Result<TraceInfo, TraceError> {
        let mut snapshot = self.state.info;
        let status = self.subsystem.control_trace(
            0,
            &self.state.name_utf16,
            &mut snapshot,
            EVENT_TRACE_CONTROL_QUERY,
        );
        check_status(status)?;
        Ok(snapshot)
    }

    /// Adopts the registration handle of an externally-started session of
    /// the same name, so it can be updated and stopped from here.
    pub fn adopt_registration(&mut self) -> Result<(), TraceError> {
        if self.state.is_registered() {
            return Ok(());
        }
        let snapshot = self.query()?;
        let handle = snapshot.properties.Wnode.HistoricalContext;
        if handle == 0 || handle == INVALID_PROCESSTRACE_HANDLE {
            return Err(TraceError::NotRegistered);
        }
        log::debug!(
            "adopted historical registration handle for trace session {:?}",
            self.state.name
        );
        self.state.registration = handle;
        Ok(())
    }

    /// Passes a trace-information class through to the subsystem.
    pub fn set_trace_information(&mut self, class: u32, data: &[u8]) -> Result<(), TraceError> {
        if !self.state.is_registered() {
            return Err(TraceError::NotRegistered);
        }
        check_status(
            self.subsystem
                .set_trace_information(self.state.registration, class, data),
        )
    }

    fn control(&mut self, code: u32) -> Result<(), TraceError> {
        let handle = self.state.control_handle();
        let status =
            self.subsystem
                .control_trace(handle, &self.state.name_utf16, &mut self.state.info, code);
        check_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSubsystem;

    fn state(name: &str) -> SessionState {
        SessionState::new(name.to_string(), TraceInfo::default())
    }

    #[test]
    fn plain_registration_stores_the_handle() {
        let fake = FakeSubsystem::new();
        let mut state = state("plain");
        SessionController::new(&fake, &mut state).register().unwrap();
        assert!(state.is_registered());
        assert_eq!(fake.start_calls(), 1);
    }

    #[test]
    fn stale_session_is_stopped_and_registration_retried() {
        let fake = FakeSubsystem::new();
        fake.script_start_status(ERROR_ALREADY_EXISTS);
        let mut state = state("stale");
        SessionController::new(&fake, &mut state).register().unwrap();
        assert!(state.is_registered());
        assert_eq!(fake.start_calls(), 2);
        assert_eq!(fake.control_calls(), vec![EVENT_TRACE_CONTROL_STOP]);
    }

    #[test]
    fn privilege_failure_degrades_to_open_close_probe() {
        let fake = FakeSubsystem::new();
        fake.script_start_status(ERROR_ACCESS_DENIED);
        let mut state = state("unprivileged");
        SessionController::new(&fake, &mut state).register().unwrap();
        // The probe validated reachability but no registration happened.
        assert!(!state.is_registered());
        assert_eq!(fake.open_calls(), 1);
        assert_eq!(fake.close_calls(), 1);
    }

    #[test]
    fn probe_failure_is_an_open_failure() {
        let fake = FakeSubsystem::new();
        fake.script_start_status(ERROR_ACCESS_DENIED);
        fake.fail_next_open();
        let mut state = state("unreachable");
        let err = SessionController::new(&fake, &mut state).register().unwrap_err();
        assert_eq!(err, TraceError::OpenFailure);
    }

    #[test]
    fn retry_exhaustion_surfaces_the_error() {
        let fake = FakeSubsystem::new();
        fake.script_start_status(ERROR_ALREADY_EXISTS);
        fake.script_start_status(ERROR_ALREADY_EXISTS);
        let mut state = state("contended");
        let err = SessionController::new(&fake, &mut state).register().unwrap_err();
        assert_eq!(err, TraceError::AlreadyExists);
    }

    #[test]
    fn stop_is_idempotent_and_tolerates_missing_instance() {
        let fake = FakeSubsystem::new();
        let mut state = state("stoppable");
        SessionController::new(&fake, &mut state).register().unwrap();

        SessionController::new(&fake, &mut state).stop().unwrap();
        assert!(!state.is_registered());
        assert!(!state.is_open());

        // Second stop goes by name; the subsystem no longer knows it.
        fake.script_control_status(EVENT_TRACE_CONTROL_STOP, ERROR_WMI_INSTANCE_NOT_FOUND);
        SessionController::new(&fake, &mut state).stop().unwrap();
        assert!(!state.is_registered());
    }

    #[test]
    fn close_tolerates_pending_teardown() {
        let fake = FakeSubsystem::new();
        let mut state = state("closing");
        let mut controller = SessionController::new(&fake, &mut state);
        controller.register().unwrap();
        controller.open(7).unwrap();

        fake.script_close_status(ERROR_CTX_CLOSE_PENDING);
        SessionController::new(&fake, &mut state).close().unwrap();
        assert!(!state.is_open());
    }

    #[test]
    fn update_requires_registration() {
        let fake = FakeSubsystem::new();
        let mut state = state("dormant");
        let err = SessionController::new(&fake, &mut state).update().unwrap_err();
        assert_eq!(err, TraceError::NotRegistered);
    }

    #[test]
    fn update_swallows_missing_instance() {
        let fake = FakeSubsystem::new();
        let mut state = state("updating");
        SessionController::new(&fake, &mut state).register().unwrap();
        fake.script_control_status(EVENT_TRACE_CONTROL_UPDATE, ERROR_WMI_INSTANCE_NOT_FOUND);
        SessionController::new(&fake, &mut state).update().unwrap();
    }

    #[test]
    fn flush_requires_registration() {
        let fake = FakeSubsystem::new();
        let mut state = state("unflushed");
        let err = SessionController::new(&fake, &mut state).flush().unwrap_err();
        assert_eq!(err, TraceError::NotRegistered);
    }

    #[test]
    fn flush_issues_the_control_and_swallows_missing_instance() {
        let fake = FakeSubsystem::new();
        let mut state = state("flushing");
        SessionController::new(&fake, &mut state).register().unwrap();
        SessionController::new(&fake, &mut state).flush().unwrap();
        assert_eq!(fake.control_calls(), vec![EVENT_TRACE_CONTROL_FLUSH]);

        fake.script_control_status(EVENT_TRACE_CONTROL_FLUSH, ERROR_WMI_INSTANCE_NOT_FOUND);
        SessionController::new(&fake, &mut state).flush().unwrap();
    }

    #[test]
    fn adopting_a_foreign_session_takes_its_historical_handle() {
        let fake = FakeSubsystem::new();
        fake.set_query_historical_context(0x5150);
        let mut state = state("foreign");
        SessionController::new(&fake, &mut state).adopt_registration().unwrap();
        assert_eq!(state.registration, 0x5150);
    }

    #[test]
    fn adoption_fails_when_the_subsystem_reports_no_session() {
        let fake = FakeSubsystem::new();
        fake.script_control_status(EVENT_TRACE_CONTROL_QUERY, ERROR_WMI_INSTANCE_NOT_FOUND);
        let mut state = state("missing");
        let err = SessionController::new(&fake, &mut state)
            .adopt_registration()
            .unwrap_err();
        assert_eq!(err, TraceError::Native(ERROR_WMI_INSTANCE_NOT_FOUND));
    }

    #[test]
    fn process_requires_an_open_handle() {
        let fake = FakeSubsystem::new();
        let mut state = state("unopened");
        let err = SessionController::new(&fake, &mut state)
            .process(None, None)
            .unwrap_err();
        assert_eq!(err, TraceError::OpenFailure);
    }

    #[test]
    fn set_trace_information_passes_through_when_registered() {
        let fake = FakeSubsystem::new();
        let mut state = state("stacks");
        SessionController::new(&fake, &mut state).register().unwrap();
        SessionController::new(&fake, &mut state)
            .set_trace_information(TRACE_STACK_TRACING_INFO, &[1, 0, 0, 0])
            .unwrap();
        assert_eq!(fake.trace_information_classes(), vec![TRACE_STACK_TRACING_INFO]);
    }
}
