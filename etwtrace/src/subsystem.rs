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

//! The call surface between session logic and the OS tracing subsystem.
//!
//! Session and dispatch code never touch FFI directly; everything goes
//! through [`TraceSubsystem`] so the state machine can be driven by the
//! fake implementation in [`crate::testing`] on any platform.

use crate::error::TraceError;
use crate::filter::{AssembledPayloadFilter, PayloadPredicate};
use crate::guid::Guid;
use etwtrace_sys::*;
use std::collections::HashMap;
use std::mem::{offset_of, size_of};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Session registration properties with the trace and log-file names
/// reserved inline behind the fixed-size header, as the registration ABI
/// requires. `Wnode.BufferSize` covers the whole block.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TraceInfo {
    pub properties: EVENT_TRACE_PROPERTIES,
    pub trace_name: [u16; MAX_PATH],
    pub logfile_name: [u16; MAX_PATH],
}

impl Default for TraceInfo {
    fn default() -> Self {
        let mut info = Self {
            properties: EVENT_TRACE_PROPERTIES::default(),
            trace_name: [0; MAX_PATH],
            logfile_name: [0; MAX_PATH],
        };
        info.properties.Wnode.BufferSize = size_of::<TraceInfo>() as u32;
        info.properties.LoggerNameOffset = offset_of!(TraceInfo, trace_name) as u32;
        info.properties.LogFileNameOffset = offset_of!(TraceInfo, logfile_name) as u32;
        info
    }
}

impl TraceInfo {
    /// Copies `name` into the inline trace-name slot, NUL-terminated and
    /// truncated to the path-length bound.
    pub fn set_trace_name(&mut self, name: &str) {
        copy_wide(&mut self.trace_name, name);
    }

    /// Copies `path` into the inline log-file-name slot.
    pub fn set_logfile_name(&mut self, path: &str) {
        copy_wide(&mut self.logfile_name, path);
    }

    /// The trace name as currently stored, without the terminator.
    pub fn trace_name(&self) -> String {
        let len = self.trace_name.iter().position(|&c| c == 0).unwrap_or(MAX_PATH);
        String::from_utf16_lossy(&self.trace_name[..len])
    }
}

fn copy_wide(slot: &mut [u16; MAX_PATH], value: &str) {
    slot.fill(0);
    for (dst, src) in slot[..MAX_PATH - 1].iter_mut().zip(value.encode_utf16()) {
        *dst = src;
    }
}

/// Every privileged call the session state machine issues. Implementations
/// return raw subsystem statuses for the control plane; the caller owns the
/// status-to-error translation so it can treat specific statuses as benign.
pub trait TraceSubsystem: Send + Sync {
    /// Registers a session, returning the status and the registration
    /// handle (valid only on success).
    fn start_trace(&self, info: &mut TraceInfo) -> (u32, TRACEHANDLE);

    /// Issues a control request (query, stop, update, flush,
    /// convert-to-realtime) by registration handle, or by NUL-terminated
    /// name when `handle` is zero.
    fn control_trace(
        &self,
        handle: TRACEHANDLE,
        name: &[u16],
        info: &mut TraceInfo,
        control: u32,
    ) -> u32;

    /// Enables, disables or requests capture-state for one provider on a
    /// registered session.
    fn enable_trace(
        &self,
        session: TRACEHANDLE,
        provider: &Guid,
        control: u32,
        level: u8,
        any: u64,
        all: u64,
        parameters: &ENABLE_TRACE_PARAMETERS,
    ) -> u32;

    /// Opens a processing handle over the prepared log-file descriptor.
    /// Returns [`INVALID_PROCESSTRACE_HANDLE`] on failure.
    fn open_trace(&self, logfile: &mut EVENT_TRACE_LOGFILEW) -> TRACEHANDLE;

    /// Pumps the processing loop. Blocks the calling thread until the
    /// session is stopped, the source is exhausted, or the subsystem fails.
    fn process_trace(
        &self,
        handle: TRACEHANDLE,
        start: Option<FILETIME>,
        end: Option<FILETIME>,
    ) -> u32;

    /// Releases a processing handle.
    fn close_trace(&self, handle: TRACEHANDLE) -> u32;

    /// Applies a trace-information class (stack tracing, system flags) to a
    /// registered session.
    fn set_trace_information(&self, session: TRACEHANDLE, class: u32, data: &[u8]) -> u32;

    /// Slow-path provider resolution through the subsystem's metadata
    /// database, for events whose header identity is indirect.
    fn resolve_provider(&self, record: &EVENT_RECORD) -> Option<Guid>;

    /// Compiles one payload predicate into an aggregated filter descriptor.
    fn aggregate_payload_filter(
        &self,
        provider: &Guid,
        predicate: &PayloadPredicate,
        manifest: Option<&Path>,
    ) -> Result<AssembledPayloadFilter, TraceError>;
}

/// Picks the real subsystem where it exists, the stub everywhere else.
pub(crate) fn platform_subsystem() -> Arc<dyn TraceSubsystem> {
    #[cfg(windows)]
    {
        Arc::new(NativeSubsystem)
    }
    #[cfg(not(windows))]
    {
        Arc::new(UnsupportedSubsystem)
    }
}

/// Stand-in on platforms without the tracing subsystem. Every control call
/// reports ERROR_NOT_SUPPORTED; sessions stay dormant.
#[derive(Debug, Default)]
pub struct UnsupportedSubsystem;

impl TraceSubsystem for UnsupportedSubsystem {
    fn start_trace(&self, _info: &mut TraceInfo) -> (u32, TRACEHANDLE) {
        (ERROR_NOT_SUPPORTED, INVALID_PROCESSTRACE_HANDLE)
    }

    fn control_trace(
        &self,
        _handle: TRACEHANDLE,
        _name: &[u16],
        _info: &mut TraceInfo,
        _control: u32,
    ) -> u32 {
        ERROR_NOT_SUPPORTED
    }

    fn enable_trace(
        &self,
        _session: TRACEHANDLE,
        _provider: &Guid,
        _control: u32,
        _level: u8,
        _any: u64,
        _all: u64,
        _parameters: &ENABLE_TRACE_PARAMETERS,
    ) -> u32 {
        ERROR_NOT_SUPPORTED
    }

    fn open_trace(&self, _logfile: &mut EVENT_TRACE_LOGFILEW) -> TRACEHANDLE {
        INVALID_PROCESSTRACE_HANDLE
    }

    fn process_trace(
        &self,
        _handle: TRACEHANDLE,
        _start: Option<FILETIME>,
        _end: Option<FILETIME>,
    ) -> u32 {
        ERROR_NOT_SUPPORTED
    }

    fn close_trace(&self, _handle: TRACEHANDLE) -> u32 {
        ERROR_NOT_SUPPORTED
    }

    fn set_trace_information(&self, _session: TRACEHANDLE, _class: u32, _data: &[u8]) -> u32 {
        ERROR_NOT_SUPPORTED
    }

    fn resolve_provider(&self, _record: &EVENT_RECORD) -> Option<Guid> {
        None
    }

    fn aggregate_payload_filter(
        &self,
        _provider: &Guid,
        _predicate: &PayloadPredicate,
        _manifest: Option<&Path>,
    ) -> Result<AssembledPayloadFilter, TraceError> {
        Err(TraceError::Unsupported)
    }
}

/// The real subsystem: status-checked FFI into `etwtrace-sys`.
#[cfg(windows)]
#[derive(Debug, Default)]
pub struct NativeSubsystem;

#[cfg(windows)]
impl TraceSubsystem for NativeSubsystem {
    fn start_trace(&self, info: &mut TraceInfo) -> (u32, TRACEHANDLE) {
        let mut handle: TRACEHANDLE = 0;
        let name = info.trace_name;
        // SAFETY: `info` is a live, correctly-sized properties block whose
        // Wnode.BufferSize spans the inline name space.
        let status =
            unsafe { StartTraceW(&mut handle, name.as_ptr(), &mut info.properties) };
        (status, handle)
    }

    fn control_trace(
        &self,
        handle: TRACEHANDLE,
        name: &[u16],
        info: &mut TraceInfo,
        control: u32,
    ) -> u32 {
        let name_ptr = if handle == 0 { name.as_ptr() } else { std::ptr::null() };
        // SAFETY: `info` is a live, correctly-sized properties block; `name`
        // is NUL-terminated when used.
        unsafe { ControlTraceW(handle, name_ptr, &mut info.properties, control) }
    }

    fn enable_trace(
        &self,
        session: TRACEHANDLE,
        provider: &Guid,
        control: u32,
        level: u8,
        any: u64,
        all: u64,
        parameters: &ENABLE_TRACE_PARAMETERS,
    ) -> u32 {
        // SAFETY: `parameters` and any filter descriptors it references are
        // kept alive by the caller across this call.
        unsafe {
            EnableTraceEx2(
                session,
                provider.as_abi(),
                control,
                level,
                any,
                all,
                0,
                parameters,
            )
        }
    }

    fn open_trace(&self, logfile: &mut EVENT_TRACE_LOGFILEW) -> TRACEHANDLE {
        // SAFETY: `logfile` is fully initialized with valid callback
        // pointers and a NUL-terminated logger or log-file name.
        unsafe { OpenTraceW(logfile) }
    }

    fn process_trace(
        &self,
        handle: TRACEHANDLE,
        start: Option<FILETIME>,
        end: Option<FILETIME>,
    ) -> u32 {
        let start_ptr = start.as_ref().map_or(std::ptr::null(), |t| t as *const FILETIME);
        let end_ptr = end.as_ref().map_or(std::ptr::null(), |t| t as *const FILETIME);
        // SAFETY: `handle` came from OpenTraceW and has not been closed.
        // Blocks until the session stops or the source is exhausted.
        unsafe { ProcessTrace(&handle, 1, start_ptr, end_ptr) }
    }

    fn close_trace(&self, handle: TRACEHANDLE) -> u32 {
        // SAFETY: `handle` came from OpenTraceW; double closes are the
        // caller's responsibility.
        unsafe { CloseTrace(handle) }
    }

    fn set_trace_information(&self, session: TRACEHANDLE, class: u32, data: &[u8]) -> u32 {
        // SAFETY: `data` is a live buffer of the declared length.
        unsafe {
            TraceSetInformation(
                session,
                class,
                data.as_ptr() as *const core::ffi::c_void,
                data.len() as u32,
            )
        }
    }

    fn resolve_provider(&self, record: &EVENT_RECORD) -> Option<Guid> {
        let mut size: u32 = 0;
        // SAFETY: a null buffer with zero size is the documented probe form.
        let status = unsafe {
            TdhGetEventInformation(record, 0, std::ptr::null_mut(), std::ptr::null_mut(), &mut size)
        };
        if status != ERROR_INSUFFICIENT_BUFFER {
            return None;
        }
        let mut buffer = vec![0u8; size as usize];
        let info = buffer.as_mut_ptr() as *mut TRACE_EVENT_INFO;
        // SAFETY: `buffer` spans the size the probe reported.
        let status = unsafe {
            TdhGetEventInformation(record, 0, std::ptr::null_mut(), info, &mut size)
        };
        if status != ERROR_SUCCESS {
            return None;
        }
        // SAFETY: on success the buffer holds at least the fixed prefix.
        Some(Guid::from_abi(unsafe { (*info).ProviderGuid }))
    }

    fn aggregate_payload_filter(
        &self,
        provider: &Guid,
        predicate: &PayloadPredicate,
        manifest: Option<&Path>,
    ) -> Result<AssembledPayloadFilter, TraceError> {
        use crate::error::check_status;
        use crate::filter::PayloadStorage;

        if let Some(path) = manifest {
            let wide = wide_path(path);
            // SAFETY: `wide` is NUL-terminated UTF-16.
            check_status(unsafe { TdhLoadManifestFromBinary(wide.as_ptr()) })?;
        }

        let field: Vec<u16> = predicate.field.encode_utf16().chain([0]).collect();
        let value: Vec<u16> = predicate.value.encode_utf16().chain([0]).collect();
        let native = PAYLOAD_FILTER_PREDICATE {
            FieldName: field.as_ptr(),
            CompareOp: predicate.op as u16,
            Value: value.as_ptr(),
        };
        let any_event = EVENT_DESCRIPTOR::default();
        let mut filter: *mut core::ffi::c_void = std::ptr::null_mut();
        // SAFETY: field and value buffers outlive the create and aggregate
        // calls below.
        check_status(unsafe {
            TdhCreatePayloadFilter(provider.as_abi(), &any_event, 1, 1, &native, &mut filter)
        })?;

        let match_all_flags: u8 = 0;
        let mut descriptor = EVENT_FILTER_DESCRIPTOR::default();
        // SAFETY: `filter` was produced by TdhCreatePayloadFilter above.
        let status = unsafe {
            TdhAggregatePayloadFilters(1, &filter, &match_all_flags, &mut descriptor)
        };
        // The aggregate owns its own copy; the per-predicate filter is done.
        // SAFETY: as above.
        unsafe {
            TdhDeletePayloadFilter(&mut filter);
        }
        check_status(status)?;
        Ok(AssembledPayloadFilter {
            descriptor,
            storage: PayloadStorage::Tdh,
        })
    }
}

#[cfg(windows)]
fn wide_path(path: &Path) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    path.as_os_str().encode_wide().chain([0]).collect()
}

/// The per-session dispatch hooks invoked by the fixed trampolines.
pub(crate) struct SessionSlot {
    /// Handles one delivered event.
    pub on_event: Box<dyn Fn(&EVENT_RECORD) + Send + Sync>,
    /// Handles one consumed buffer; returns false to stop processing.
    pub on_buffer: Box<dyn Fn(&EVENT_TRACE_LOGFILEW) -> bool + Send + Sync>,
}

// The subsystem smuggles an opaque context value through its callbacks.
// Rather than casting that value back to a session pointer, it is a key
// into this table, so a stale or hostile value can only miss.
static NEXT_SESSION_KEY: AtomicUsize = AtomicUsize::new(1);
static SESSIONS: OnceLock<Mutex<HashMap<usize, Arc<SessionSlot>>>> = OnceLock::new();

fn sessions() -> &'static Mutex<HashMap<usize, Arc<SessionSlot>>> {
    SESSIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Installs the dispatch hooks and returns the context key to wire into the
/// log-file descriptor.
pub(crate) fn register_session(slot: SessionSlot) -> usize {
    let key = NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed);
    sessions().lock().unwrap().insert(key, Arc::new(slot));
    key
}

/// Removes the dispatch hooks. Events delivered after this point miss the
/// table and are ignored.
pub(crate) fn unregister_session(key: usize) {
    sessions().lock().unwrap().remove(&key);
}

pub(crate) fn lookup_session(key: usize) -> Option<Arc<SessionSlot>> {
    sessions().lock().unwrap().get(&key).cloned()
}

/// The fixed per-event entry point installed with the subsystem. Panics in
/// user callbacks cannot unwind into the foreign frame, so they abort.
pub(crate) unsafe extern "system" fn event_record_trampoline(record: *mut EVENT_RECORD) {
    let result = std::panic::catch_unwind(|| {
        if record.is_null() {
            return;
        }
        // SAFETY: the subsystem passes a record valid for this call.
        let record = unsafe { &*record };
        let key = record.UserContext as usize;
        if let Some(slot) = lookup_session(key) {
            (slot.on_event)(record);
        }
    });
    if let Err(err) = result {
        eprintln!("Fatal panic in event callback: {:?}", err);
        std::process::abort();
    }
}

/// The fixed per-buffer entry point. Returns FALSE to ask the subsystem to
/// unwind its processing loop.
pub(crate) unsafe extern "system" fn buffer_trampoline(logfile: *mut EVENT_TRACE_LOGFILEW) -> u32 {
    let result = std::panic::catch_unwind(|| {
        if logfile.is_null() {
            return false;
        }
        // SAFETY: the subsystem passes a descriptor valid for this call.
        let logfile = unsafe { &*logfile };
        let key = logfile.Context as usize;
        match lookup_session(key) {
            Some(slot) => (slot.on_buffer)(logfile),
            None => false,
        }
    });
    match result {
        Ok(keep_going) => keep_going as u32,
        Err(err) => {
            eprintln!("Fatal panic in buffer callback: {:?}", err);
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn trace_info_reserves_inline_names() {
        let info = TraceInfo::default();
        assert_eq!(info.properties.Wnode.BufferSize as usize, size_of::<TraceInfo>());
        assert_eq!(info.properties.LoggerNameOffset as usize, size_of::<EVENT_TRACE_PROPERTIES>());
        assert_eq!(
            info.properties.LogFileNameOffset as usize,
            size_of::<EVENT_TRACE_PROPERTIES>() + 2 * MAX_PATH
        );
    }

    #[test]
    fn trace_name_round_trips_and_truncates() {
        let mut info = TraceInfo::default();
        info.set_trace_name("My Session");
        assert_eq!(info.trace_name(), "My Session");

        let long = "x".repeat(MAX_PATH * 2);
        info.set_trace_name(&long);
        assert_eq!(info.trace_name().len(), MAX_PATH - 1);
        assert_eq!(info.trace_name[MAX_PATH - 1], 0);
    }

    #[test]
    fn registry_round_trip() {
        let key = register_session(SessionSlot {
            on_event: Box::new(|_| {}),
            on_buffer: Box::new(|_| true),
        });
        assert!(lookup_session(key).is_some());
        unregister_session(key);
        assert!(lookup_session(key).is_none());
    }

    #[test]
    fn event_trampoline_routes_by_context_key() {
        static HITS: AtomicU32 = AtomicU32::new(0);
        let key = register_session(SessionSlot {
            on_event: Box::new(|record| {
                assert_eq!(record.EventHeader.EventDescriptor.Id, 9);
                HITS.fetch_add(1, Ordering::Relaxed);
            }),
            on_buffer: Box::new(|_| true),
        });

        let mut record = EVENT_RECORD::default();
        record.EventHeader.EventDescriptor.Id = 9;
        record.UserContext = key as *mut core::ffi::c_void;
        // SAFETY: the record is live for the duration of the call.
        unsafe { event_record_trampoline(&mut record) };
        assert_eq!(HITS.load(Ordering::Relaxed), 1);

        // A key that is not in the table is silently ignored.
        record.UserContext = usize::MAX as *mut core::ffi::c_void;
        // SAFETY: as above.
        unsafe { event_record_trampoline(&mut record) };
        assert_eq!(HITS.load(Ordering::Relaxed), 1);

        unregister_session(key);
    }

    #[test]
    fn buffer_trampoline_reports_continuation() {
        let key = register_session(SessionSlot {
            on_event: Box::new(|_| {}),
            on_buffer: Box::new(|logfile| logfile.BuffersRead < 2),
        });

        let mut logfile = EVENT_TRACE_LOGFILEW::default();
        logfile.Context = key as *mut core::ffi::c_void;
        logfile.BuffersRead = 1;
        // SAFETY: the descriptor is live for the duration of the call.
        assert_eq!(unsafe { buffer_trampoline(&mut logfile) }, 1);
        logfile.BuffersRead = 2;
        // SAFETY: as above.
        assert_eq!(unsafe { buffer_trampoline(&mut logfile) }, 0);

        unregister_session(key);
    }
}
