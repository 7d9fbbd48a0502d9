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

//! # Safety
//!
//! This crate provides raw FFI bindings to the ETW consumer ABI
//! (`evntrace.h`, `evntcons.h`, `evntprov.h`, `tdh.h`).
//! - All `extern "system"` functions are `unsafe` to call. Callers must uphold
//!   the preconditions documented by the Windows SDK headers.
//! - Pointers must obey C rules: correct lifetimes, alignment, nullability,
//!   and initialization. `TRACEHANDLE` values follow the subsystem's
//!   ownership rules.
//! - Struct layouts with `#[repr(C)]` mirror the C ABI bit-for-bit. The type
//!   definitions compile on every platform; the extern blocks are gated on
//!   `cfg(windows)`.
//! - This crate does not validate string encodings or lengths; pass
//!   NUL-terminated UTF-16 buffers where the C API requires them.
//!
//! Prefer the higher-level safe wrapper crate `etwtrace`.

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(non_snake_case)]

use core::ffi::c_void;

pub type TRACEHANDLE = u64;
pub type HANDLE = *mut c_void;

/// `(TRACEHANDLE)INVALID_HANDLE_VALUE`, the sentinel for both registration
/// and processing handles.
pub const INVALID_PROCESSTRACE_HANDLE: TRACEHANDLE = u64::MAX;

pub const MAX_PATH: usize = 260;

/// The reserved session name of the NT kernel logger.
pub const KERNEL_LOGGER_NAME: &str = "NT Kernel Logger";

// Win32 status codes surfaced by the trace control APIs.
pub const ERROR_SUCCESS: u32 = 0;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_BAD_LENGTH: u32 = 24;
pub const ERROR_NOT_SUPPORTED: u32 = 50;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
pub const ERROR_ALREADY_EXISTS: u32 = 183;
pub const ERROR_MORE_DATA: u32 = 234;
pub const ERROR_NOACCESS: u32 = 998;
pub const ERROR_CANCELLED: u32 = 1223;
pub const ERROR_WMI_INSTANCE_NOT_FOUND: u32 = 4201;
pub const ERROR_CTX_CLOSE_PENDING: u32 = 7007;

pub const WNODE_FLAG_TRACED_GUID: u32 = 0x0002_0000;

// Log file mode bits (subset consumed by session configuration).
pub const EVENT_TRACE_FILE_MODE_NONE: u32 = 0x0000_0000;
pub const EVENT_TRACE_FILE_MODE_SEQUENTIAL: u32 = 0x0000_0001;
pub const EVENT_TRACE_FILE_MODE_CIRCULAR: u32 = 0x0000_0002;
pub const EVENT_TRACE_FILE_MODE_NEWFILE: u32 = 0x0000_0008;
pub const EVENT_TRACE_REAL_TIME_MODE: u32 = 0x0000_0100;
pub const EVENT_TRACE_BUFFERING_MODE: u32 = 0x0000_0400;
pub const EVENT_TRACE_PRIVATE_LOGGER_MODE: u32 = 0x0000_0800;
pub const EVENT_TRACE_SYSTEM_LOGGER_MODE: u32 = 0x0200_0000;
pub const EVENT_TRACE_INDEPENDENT_SESSION_MODE: u32 = 0x0800_0000;
pub const EVENT_TRACE_NO_PER_PROCESSOR_BUFFERING: u32 = 0x1000_0000;

// ControlTrace control codes.
pub const EVENT_TRACE_CONTROL_QUERY: u32 = 0;
pub const EVENT_TRACE_CONTROL_STOP: u32 = 1;
pub const EVENT_TRACE_CONTROL_UPDATE: u32 = 2;
pub const EVENT_TRACE_CONTROL_FLUSH: u32 = 3;
pub const EVENT_TRACE_CONTROL_INCREMENT_FILE: u32 = 4;
pub const EVENT_TRACE_CONTROL_CONVERT_TO_REALTIME: u32 = 5;

// EnableTraceEx2 control codes.
pub const EVENT_CONTROL_CODE_DISABLE_PROVIDER: u32 = 0;
pub const EVENT_CONTROL_CODE_ENABLE_PROVIDER: u32 = 1;
pub const EVENT_CONTROL_CODE_CAPTURE_STATE: u32 = 2;

pub const ENABLE_TRACE_PARAMETERS_VERSION: u32 = 1;
pub const ENABLE_TRACE_PARAMETERS_VERSION_2: u32 = 2;

// Severity levels for EnableTraceEx2 and EVENT_DESCRIPTOR::Level.
pub const TRACE_LEVEL_NONE: u8 = 0;
pub const TRACE_LEVEL_CRITICAL: u8 = 1;
pub const TRACE_LEVEL_ERROR: u8 = 2;
pub const TRACE_LEVEL_WARNING: u8 = 3;
pub const TRACE_LEVEL_INFORMATION: u8 = 4;
pub const TRACE_LEVEL_VERBOSE: u8 = 5;

// EVENT_ENABLE_PROPERTY_* bits carried in ENABLE_TRACE_PARAMETERS.
pub const EVENT_ENABLE_PROPERTY_SID: u32 = 0x0000_0001;
pub const EVENT_ENABLE_PROPERTY_TS_ID: u32 = 0x0000_0002;
pub const EVENT_ENABLE_PROPERTY_STACK_TRACE: u32 = 0x0000_0004;
pub const EVENT_ENABLE_PROPERTY_IGNORE_KEYWORD_0: u32 = 0x0000_0010;
pub const EVENT_ENABLE_PROPERTY_PROVIDER_GROUP: u32 = 0x0000_0020;
pub const EVENT_ENABLE_PROPERTY_PROCESS_START_KEY: u32 = 0x0000_0080;
pub const EVENT_ENABLE_PROPERTY_EVENT_KEY: u32 = 0x0000_0100;
pub const EVENT_ENABLE_PROPERTY_EXCLUDE_INPRIVATE: u32 = 0x0000_0200;

// EVENT_FILTER_TYPE values for EVENT_FILTER_DESCRIPTOR::Type.
pub const EVENT_FILTER_TYPE_NONE: u32 = 0x0000_0000;
pub const EVENT_FILTER_TYPE_SCHEMATIZED: u32 = 0x8000_0000;
pub const EVENT_FILTER_TYPE_SYSTEM_FLAGS: u32 = 0x8000_0001;
pub const EVENT_FILTER_TYPE_TRACEHANDLE: u32 = 0x8000_0002;
pub const EVENT_FILTER_TYPE_PID: u32 = 0x8000_0004;
pub const EVENT_FILTER_TYPE_EXECUTABLE_NAME: u32 = 0x8000_0008;
pub const EVENT_FILTER_TYPE_PACKAGE_ID: u32 = 0x8000_0010;
pub const EVENT_FILTER_TYPE_PACKAGE_APP_ID: u32 = 0x8000_0020;
pub const EVENT_FILTER_TYPE_PAYLOAD: u32 = 0x8000_0100;
pub const EVENT_FILTER_TYPE_EVENT_ID: u32 = 0x8000_0200;
pub const EVENT_FILTER_TYPE_EVENT_NAME: u32 = 0x8000_0400;
pub const EVENT_FILTER_TYPE_STACKWALK: u32 = 0x8000_1000;

/// Fixed number of EVENT_FILTER_DESCRIPTOR slots accepted per enable call.
pub const MAX_EVENT_FILTERS_COUNT: usize = 15;
pub const MAX_EVENT_FILTER_PID_COUNT: usize = 8;
pub const MAX_EVENT_FILTER_EVENT_ID_COUNT: usize = 64;
pub const MAX_PAYLOAD_PREDICATES: usize = 8;

// PAYLOAD_OPERATOR values for PAYLOAD_FILTER_PREDICATE::CompareOp.
pub const PAYLOADFIELD_EQ: u16 = 0;
pub const PAYLOADFIELD_NE: u16 = 1;
pub const PAYLOADFIELD_LE: u16 = 2;
pub const PAYLOADFIELD_GT: u16 = 3;
pub const PAYLOADFIELD_LT: u16 = 4;
pub const PAYLOADFIELD_GE: u16 = 5;
pub const PAYLOADFIELD_BETWEEN: u16 = 6;
pub const PAYLOADFIELD_NOTBETWEEN: u16 = 7;
pub const PAYLOADFIELD_MODULO: u16 = 8;
pub const PAYLOADFIELD_CONTAINS: u16 = 20;
pub const PAYLOADFIELD_DOESNTCONTAIN: u16 = 21;
pub const PAYLOADFIELD_IS: u16 = 30;
pub const PAYLOADFIELD_ISNOT: u16 = 31;

// EVENT_HEADER::Flags bits.
pub const EVENT_HEADER_FLAG_EXTENDED_INFO: u16 = 0x0001;
pub const EVENT_HEADER_FLAG_PRIVATE_SESSION: u16 = 0x0002;
pub const EVENT_HEADER_FLAG_STRING_ONLY: u16 = 0x0004;
pub const EVENT_HEADER_FLAG_TRACE_MESSAGE: u16 = 0x0008;
pub const EVENT_HEADER_FLAG_NO_CPUTIME: u16 = 0x0010;
pub const EVENT_HEADER_FLAG_32_BIT_HEADER: u16 = 0x0020;
pub const EVENT_HEADER_FLAG_64_BIT_HEADER: u16 = 0x0040;
pub const EVENT_HEADER_FLAG_CLASSIC_HEADER: u16 = 0x0100;
pub const EVENT_HEADER_FLAG_PROCESSOR_INDEX: u16 = 0x0200;

// ProcessTraceMode bits for EVENT_TRACE_LOGFILEW.
pub const PROCESS_TRACE_MODE_REAL_TIME: u32 = 0x0000_0100;
pub const PROCESS_TRACE_MODE_RAW_TIMESTAMP: u32 = 0x0000_1000;
pub const PROCESS_TRACE_MODE_EVENT_RECORD: u32 = 0x1000_0000;

// EnableFlags bits selecting NT kernel logger providers.
pub const EVENT_TRACE_FLAG_PROCESS: u32 = 0x0000_0001;
pub const EVENT_TRACE_FLAG_THREAD: u32 = 0x0000_0002;
pub const EVENT_TRACE_FLAG_IMAGE_LOAD: u32 = 0x0000_0004;
pub const EVENT_TRACE_FLAG_PROCESS_COUNTERS: u32 = 0x0000_0008;
pub const EVENT_TRACE_FLAG_CSWITCH: u32 = 0x0000_0010;
pub const EVENT_TRACE_FLAG_DPC: u32 = 0x0000_0020;
pub const EVENT_TRACE_FLAG_INTERRUPT: u32 = 0x0000_0040;
pub const EVENT_TRACE_FLAG_SYSTEMCALL: u32 = 0x0000_0080;
pub const EVENT_TRACE_FLAG_DISK_IO: u32 = 0x0000_0100;
pub const EVENT_TRACE_FLAG_DISK_FILE_IO: u32 = 0x0000_0200;
pub const EVENT_TRACE_FLAG_DISK_IO_INIT: u32 = 0x0000_0400;
pub const EVENT_TRACE_FLAG_DISPATCHER: u32 = 0x0000_0800;
pub const EVENT_TRACE_FLAG_MEMORY_PAGE_FAULTS: u32 = 0x0000_1000;
pub const EVENT_TRACE_FLAG_MEMORY_HARD_FAULTS: u32 = 0x0000_2000;
pub const EVENT_TRACE_FLAG_VIRTUAL_ALLOC: u32 = 0x0000_4000;
pub const EVENT_TRACE_FLAG_VAMAP: u32 = 0x0000_8000;
pub const EVENT_TRACE_FLAG_NETWORK_TCPIP: u32 = 0x0001_0000;
pub const EVENT_TRACE_FLAG_REGISTRY: u32 = 0x0002_0000;
pub const EVENT_TRACE_FLAG_DEBUG_EVENTS: u32 = 0x0004_0000;
pub const EVENT_TRACE_FLAG_ALPC: u32 = 0x0010_0000;
pub const EVENT_TRACE_FLAG_SPLIT_IO: u32 = 0x0020_0000;
pub const EVENT_TRACE_FLAG_DRIVER: u32 = 0x0080_0000;
pub const EVENT_TRACE_FLAG_PROFILE: u32 = 0x0100_0000;
pub const EVENT_TRACE_FLAG_FILE_IO: u32 = 0x0200_0000;
pub const EVENT_TRACE_FLAG_FILE_IO_INIT: u32 = 0x0400_0000;

// TRACE_INFO_CLASS values accepted by TraceSetInformation.
pub const TRACE_STACK_TRACING_INFO: u32 = 3;
pub const TRACE_SYSTEM_TRACE_ENABLE_FLAGS_INFO: u32 = 4;
pub const TRACE_PROFILE_SOURCE_CONFIG_INFO: u32 = 5;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GUID {
    pub Data1: u32,
    pub Data2: u16,
    pub Data3: u16,
    pub Data4: [u8; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FILETIME {
    pub dwLowDateTime: u32,
    pub dwHighDateTime: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SYSTEMTIME {
    pub wYear: u16,
    pub wMonth: u16,
    pub wDayOfWeek: u16,
    pub wDay: u16,
    pub wHour: u16,
    pub wMinute: u16,
    pub wSecond: u16,
    pub wMilliseconds: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TIME_ZONE_INFORMATION {
    pub Bias: i32,
    pub StandardName: [u16; 32],
    pub StandardDate: SYSTEMTIME,
    pub StandardBias: i32,
    pub DaylightName: [u16; 32],
    pub DaylightDate: SYSTEMTIME,
    pub DaylightBias: i32,
}

impl Default for TIME_ZONE_INFORMATION {
    fn default() -> Self {
        // SAFETY: all fields are plain integers; the all-zero pattern is valid.
        unsafe { core::mem::zeroed() }
    }
}

/// `HistoricalContext` doubles as the registration handle when a session is
/// queried rather than started by this process.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct WNODE_HEADER {
    pub BufferSize: u32,
    pub ProviderId: u32,
    pub HistoricalContext: u64,
    pub TimeStamp: i64,
    pub Guid: GUID,
    pub ClientContext: u32,
    pub Flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EVENT_TRACE_PROPERTIES {
    pub Wnode: WNODE_HEADER,
    pub BufferSize: u32,
    pub MinimumBuffers: u32,
    pub MaximumBuffers: u32,
    pub MaximumFileSize: u32,
    pub LogFileMode: u32,
    pub FlushTimer: u32,
    pub EnableFlags: u32,
    /// Union of `AgeLimit` (decay minutes, obsolete) and `FlushThreshold`.
    pub FlushThreshold: i32,
    pub NumberOfBuffers: u32,
    pub FreeBuffers: u32,
    pub EventsLost: u32,
    pub BuffersWritten: u32,
    pub LogBuffersLost: u32,
    pub RealTimeBuffersLost: u32,
    pub LoggerThreadId: u64,
    pub LogFileNameOffset: u32,
    pub LoggerNameOffset: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct EVENT_TRACE_PROPERTIES_V2 {
    pub Wnode: WNODE_HEADER,
    pub BufferSize: u32,
    pub MinimumBuffers: u32,
    pub MaximumBuffers: u32,
    pub MaximumFileSize: u32,
    pub LogFileMode: u32,
    pub FlushTimer: u32,
    pub EnableFlags: u32,
    pub FlushThreshold: i32,
    pub NumberOfBuffers: u32,
    pub FreeBuffers: u32,
    pub EventsLost: u32,
    pub BuffersWritten: u32,
    pub LogBuffersLost: u32,
    pub RealTimeBuffersLost: u32,
    pub LoggerThreadId: u64,
    pub LogFileNameOffset: u32,
    pub LoggerNameOffset: u32,
    /// Union of the `VersionNumber` bit-field and `V2Control`.
    pub V2Control: u32,
    pub FilterDescCount: u32,
    pub FilterDesc: *const EVENT_FILTER_DESCRIPTOR,
    /// Union of the `Wow64`/`QpcDeltaTracking` bit-fields and `V2Options`.
    pub V2Options: u64,
}

impl Default for EVENT_TRACE_PROPERTIES_V2 {
    fn default() -> Self {
        // SAFETY: every field accepts the all-zero pattern (null pointer,
        // zero integers).
        unsafe { core::mem::zeroed() }
    }
}

/// The native {pointer, size, type-tag} filter triple.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EVENT_FILTER_DESCRIPTOR {
    pub Ptr: u64,
    pub Size: u32,
    pub Type: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ENABLE_TRACE_PARAMETERS {
    pub Version: u32,
    pub EnableProperty: u32,
    pub ControlFlags: u32,
    pub SourceId: GUID,
    pub EnableFilterDesc: *const EVENT_FILTER_DESCRIPTOR,
    pub FilterDescCount: u32,
}

impl Default for ENABLE_TRACE_PARAMETERS {
    fn default() -> Self {
        Self {
            Version: ENABLE_TRACE_PARAMETERS_VERSION_2,
            EnableProperty: 0,
            ControlFlags: 0,
            SourceId: GUID::default(),
            EnableFilterDesc: core::ptr::null(),
            FilterDescCount: 0,
        }
    }
}

/// Variably-sized packed layout consumed via EVENT_FILTER_TYPE_EVENT_ID and
/// EVENT_FILTER_TYPE_STACKWALK descriptors. `Events` is a flexible tail of
/// `Count` u16 identifiers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EVENT_FILTER_EVENT_ID {
    pub FilterIn: u8,
    pub Reserved: u8,
    pub Count: u16,
    pub Events: [u16; 0],
}

/// Variably-sized packed layout consumed via EVENT_FILTER_TYPE_EVENT_NAME
/// descriptors. `Names` is a flexible tail of `NameCount` NUL-terminated
/// UTF-8 event names.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EVENT_FILTER_EVENT_NAME {
    pub MatchAnyKeyword: u64,
    pub MatchAllKeyword: u64,
    pub Level: u8,
    pub FilterIn: u8,
    pub NameCount: u16,
    pub Names: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EVENT_DESCRIPTOR {
    pub Id: u16,
    pub Version: u8,
    pub Channel: u8,
    pub Level: u8,
    pub Opcode: u8,
    pub Task: u16,
    pub Keyword: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EVENT_HEADER {
    pub Size: u16,
    pub HeaderType: u16,
    pub Flags: u16,
    pub EventProperty: u16,
    pub ThreadId: u32,
    pub ProcessId: u32,
    pub TimeStamp: i64,
    pub ProviderId: GUID,
    pub EventDescriptor: EVENT_DESCRIPTOR,
    /// Union of `{KernelTime, UserTime}` and `ProcessorTime`.
    pub ProcessorTime: u64,
    pub ActivityId: GUID,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ETW_BUFFER_CONTEXT {
    /// Union of `{ProcessorNumber, Alignment}` and `ProcessorIndex`.
    pub ProcessorIndex: u16,
    pub LoggerId: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct EVENT_RECORD {
    pub EventHeader: EVENT_HEADER,
    pub BufferContext: ETW_BUFFER_CONTEXT,
    pub ExtendedDataCount: u16,
    pub UserDataLength: u16,
    pub ExtendedData: *mut c_void,
    pub UserData: *mut c_void,
    pub UserContext: *mut c_void,
}

impl Default for EVENT_RECORD {
    fn default() -> Self {
        Self {
            EventHeader: EVENT_HEADER::default(),
            BufferContext: ETW_BUFFER_CONTEXT::default(),
            ExtendedDataCount: 0,
            UserDataLength: 0,
            ExtendedData: core::ptr::null_mut(),
            UserData: core::ptr::null_mut(),
            UserContext: core::ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EVENT_TRACE_HEADER {
    pub Size: u16,
    /// Union of `FieldTypeFlags` and `{HeaderType, MarkerFlags}`.
    pub FieldTypeFlags: u16,
    /// Union of `Version` and `Class{Type, Level, Version}`.
    pub Version: u32,
    pub ThreadId: u32,
    pub ProcessId: u32,
    pub TimeStamp: i64,
    /// Union of `Guid` and `GuidPtr`.
    pub Guid: GUID,
    /// Union of `{KernelTime, UserTime}`, `ProcessorTime` and
    /// `{ClientContext, Flags}`.
    pub ProcessorTime: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EVENT_TRACE {
    pub Header: EVENT_TRACE_HEADER,
    pub InstanceId: u32,
    pub ParentInstanceId: u32,
    pub ParentGuid: GUID,
    pub MofData: *mut c_void,
    pub MofLength: u32,
    /// Union of `ClientContext` and `BufferContext`.
    pub ClientContext: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TRACE_LOGFILE_HEADER {
    pub BufferSize: u32,
    /// Union of `Version` and `VersionDetail`.
    pub Version: u32,
    pub ProviderVersion: u32,
    pub NumberOfProcessors: u32,
    pub EndTime: i64,
    pub TimerResolution: u32,
    pub MaximumFileSize: u32,
    pub LogFileMode: u32,
    pub BuffersWritten: u32,
    /// Union of `LogInstanceGuid` and
    /// `{StartBuffers, PointerSize, EventsLost, CpuSpeedInMHz}`.
    pub LogInstanceGuid: GUID,
    pub LoggerName: *mut u16,
    pub LogFileName: *mut u16,
    pub TimeZone: TIME_ZONE_INFORMATION,
    pub BootTime: i64,
    pub PerfFreq: i64,
    pub StartTime: i64,
    pub ReservedFlags: u32,
    pub BuffersLost: u32,
}

pub type PEVENT_RECORD_CALLBACK = Option<unsafe extern "system" fn(event_record: *mut EVENT_RECORD)>;

pub type PEVENT_TRACE_BUFFER_CALLBACKW =
    Option<unsafe extern "system" fn(logfile: *mut EVENT_TRACE_LOGFILEW) -> u32>;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EVENT_TRACE_LOGFILEW {
    pub LogFileName: *const u16,
    pub LoggerName: *const u16,
    pub CurrentTime: i64,
    pub BuffersRead: u32,
    /// Union of `LogFileMode` and `ProcessTraceMode`.
    pub ProcessTraceMode: u32,
    pub CurrentEvent: EVENT_TRACE,
    pub LogfileHeader: TRACE_LOGFILE_HEADER,
    pub BufferCallback: PEVENT_TRACE_BUFFER_CALLBACKW,
    pub BufferSize: u32,
    pub Filled: u32,
    pub EventsLost: u32,
    /// Union of `EventCallback` and `EventRecordCallback`.
    pub EventRecordCallback: PEVENT_RECORD_CALLBACK,
    pub IsKernelTrace: u32,
    pub Context: *mut c_void,
}

impl Default for EVENT_TRACE_LOGFILEW {
    fn default() -> Self {
        // SAFETY: every field accepts the all-zero pattern (null pointers,
        // `None` function pointers, zero integers).
        unsafe { core::mem::zeroed() }
    }
}

/// Fixed-size prefix of the TDH event metadata block. The full structure is
/// followed by `PropertyCount` EVENT_PROPERTY_INFO entries and a string tail
/// addressed by the *Offset fields.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TRACE_EVENT_INFO {
    pub ProviderGuid: GUID,
    pub EventGuid: GUID,
    pub EventDescriptor: EVENT_DESCRIPTOR,
    pub DecodingSource: u32,
    pub ProviderNameOffset: u32,
    pub LevelNameOffset: u32,
    pub ChannelNameOffset: u32,
    pub KeywordsNameOffset: u32,
    pub TaskNameOffset: u32,
    pub OpcodeNameOffset: u32,
    pub EventMessageOffset: u32,
    pub ProviderMessageOffset: u32,
    pub BinaryXMLOffset: u32,
    pub BinaryXMLSize: u32,
    /// Union of `EventNameOffset` and `ActivityIDNameOffset`.
    pub EventNameOffset: u32,
    /// Union of `EventAttributesOffset` and `RelatedActivityIDNameOffset`.
    pub EventAttributesOffset: u32,
    pub PropertyCount: u32,
    pub TopLevelPropertyCount: u32,
    /// Union of `Flags` and `Tags`.
    pub Flags: u32,
}

#[cfg(windows)]
#[link(name = "advapi32")]
unsafe extern "system" {
    pub fn StartTraceW(
        TraceHandle: *mut TRACEHANDLE,
        InstanceName: *const u16,
        Properties: *mut EVENT_TRACE_PROPERTIES,
    ) -> u32;

    pub fn ControlTraceW(
        TraceHandle: TRACEHANDLE,
        InstanceName: *const u16,
        Properties: *mut EVENT_TRACE_PROPERTIES,
        ControlCode: u32,
    ) -> u32;

    pub fn EnableTraceEx2(
        TraceHandle: TRACEHANDLE,
        ProviderId: *const GUID,
        ControlCode: u32,
        Level: u8,
        MatchAnyKeyword: u64,
        MatchAllKeyword: u64,
        Timeout: u32,
        EnableParameters: *const ENABLE_TRACE_PARAMETERS,
    ) -> u32;

    pub fn OpenTraceW(Logfile: *mut EVENT_TRACE_LOGFILEW) -> TRACEHANDLE;

    pub fn ProcessTrace(
        HandleArray: *const TRACEHANDLE,
        HandleCount: u32,
        StartTime: *const FILETIME,
        EndTime: *const FILETIME,
    ) -> u32;

    pub fn CloseTrace(TraceHandle: TRACEHANDLE) -> u32;

    pub fn TraceSetInformation(
        SessionHandle: TRACEHANDLE,
        InformationClass: u32,
        TraceInformation: *const c_void,
        InformationLength: u32,
    ) -> u32;
}

/// One payload comparison submitted to TdhCreatePayloadFilter.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PAYLOAD_FILTER_PREDICATE {
    pub FieldName: *const u16,
    pub CompareOp: u16,
    pub Value: *const u16,
}

#[cfg(windows)]
#[link(name = "tdh")]
unsafe extern "system" {
    pub fn TdhGetEventInformation(
        Event: *const EVENT_RECORD,
        TdhContextCount: u32,
        TdhContext: *mut c_void,
        Buffer: *mut TRACE_EVENT_INFO,
        BufferSize: *mut u32,
    ) -> u32;

    pub fn TdhLoadManifestFromBinary(BinaryPath: *const u16) -> u32;

    pub fn TdhCreatePayloadFilter(
        ProviderGuid: *const GUID,
        EventDescriptor: *const EVENT_DESCRIPTOR,
        EventMatchANY: u8,
        PayloadPredicateCount: u32,
        PayloadPredicates: *const PAYLOAD_FILTER_PREDICATE,
        PayloadFilter: *mut *mut c_void,
    ) -> u32;

    pub fn TdhAggregatePayloadFilters(
        PayloadFilterCount: u32,
        PayloadFilterPtrs: *const *mut c_void,
        EventMatchALLFlags: *const u8,
        EventFilterDescriptor: *mut EVENT_FILTER_DESCRIPTOR,
    ) -> u32;

    pub fn TdhDeletePayloadFilter(PayloadFilter: *mut *mut c_void) -> u32;

    pub fn TdhCleanupPayloadEventFilterDescriptor(
        EventFilterDescriptor: *mut EVENT_FILTER_DESCRIPTOR,
    ) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    // Layout checks against the 64-bit Windows SDK values. The bindings are
    // hand-written, so sizes and offsets are pinned here.
    #[test]
    fn abi_layout() {
        assert_eq!(size_of::<GUID>(), 16);
        assert_eq!(size_of::<WNODE_HEADER>(), 48);
        assert_eq!(size_of::<EVENT_TRACE_PROPERTIES>(), 120);
        assert_eq!(size_of::<EVENT_FILTER_DESCRIPTOR>(), 16);
        assert_eq!(size_of::<ENABLE_TRACE_PARAMETERS>(), 48);
        assert_eq!(size_of::<EVENT_DESCRIPTOR>(), 16);
        assert_eq!(size_of::<EVENT_HEADER>(), 80);
        assert_eq!(size_of::<EVENT_RECORD>(), 112);
        assert_eq!(size_of::<TIME_ZONE_INFORMATION>(), 172);
    }

    #[test]
    fn properties_name_offsets() {
        assert_eq!(offset_of!(EVENT_TRACE_PROPERTIES, LoggerNameOffset), 116);
        assert_eq!(offset_of!(EVENT_TRACE_PROPERTIES, EnableFlags), 72);
    }

    #[test]
    fn packed_filter_tails() {
        // Header sizes of the variably-sized filter layouts; the tails follow
        // immediately after these offsets.
        assert_eq!(offset_of!(EVENT_FILTER_EVENT_ID, Events), 4);
        assert_eq!(offset_of!(EVENT_FILTER_EVENT_NAME, Names), 20);
    }

    #[test]
    fn invalid_handle_is_all_ones() {
        assert_eq!(INVALID_PROCESSTRACE_HANDLE, 0xFFFF_FFFF_FFFF_FFFF);
    }
}
