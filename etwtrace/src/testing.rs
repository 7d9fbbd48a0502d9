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

//! Test doubles for the tracing subsystem.
//!
//! [`FakeSubsystem`] journals every privileged call, lets tests script
//! failure statuses, and delivers synthesized events through the real
//! trampoline path. [`SynthRecord`] builds the raw records to deliver.
//! Both work on any platform, so session logic is testable without a
//! kernel.

use crate::error::TraceError;
use crate::filter::{AssembledPayloadFilter, PayloadPredicate, PayloadStorage};
use crate::guid::Guid;
use crate::subsystem::{TraceInfo, TraceSubsystem};
use etwtrace_sys::*;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// One EnableTraceEx2 call as the fake observed it.
#[derive(Clone, Debug)]
pub struct EnableCall {
    pub provider: Guid,
    pub control: u32,
    pub level: u8,
    pub any: u64,
    pub all: u64,
    /// Enable-property bits from the parameters block.
    pub properties: u32,
    /// Type tags of the submitted filter descriptors, in slot order.
    pub filter_types: Vec<u32>,
}

#[derive(Default)]
struct FakeInner {
    start_statuses: VecDeque<u32>,
    control_statuses: HashMap<u32, VecDeque<u32>>,
    close_statuses: VecDeque<u32>,
    fail_next_open: bool,

    next_handle: TRACEHANDLE,
    start_calls: usize,
    open_calls: usize,
    close_calls: usize,
    control_calls: Vec<u32>,
    enables: Vec<EnableCall>,
    trace_information_classes: Vec<u32>,
    last_start_enable_flags: u32,
    last_control_enable_flags: u32,

    query_events_lost: u32,
    query_buffers_written: u32,
    query_free_buffers: u32,
    query_buffers_lost: u32,
    query_historical_context: u64,

    classic_map: HashMap<Guid, Guid>,

    // Delivery hooks captured from the last successful open.
    event_callback: PEVENT_RECORD_CALLBACK,
    context: usize,

    processing: bool,
    process_released: bool,
    process_status: u32,
    events_delivered: u64,
}

/// A scriptable, journaling stand-in for the OS tracing subsystem.
pub struct FakeSubsystem {
    inner: Mutex<FakeInner>,
    signal: Condvar,
}

impl Default for FakeSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSubsystem {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeInner {
                next_handle: 0x100,
                ..FakeInner::default()
            }),
            signal: Condvar::new(),
        }
    }

    /// Queues a status for the next StartTrace call. Unscripted calls
    /// succeed.
    pub fn script_start_status(&self, status: u32) {
        self.inner.lock().unwrap().start_statuses.push_back(status);
    }

    /// Queues a status for the next ControlTrace call with `control`.
    pub fn script_control_status(&self, control: u32, status: u32) {
        self.inner
            .lock()
            .unwrap()
            .control_statuses
            .entry(control)
            .or_default()
            .push_back(status);
    }

    /// Queues a status for the next CloseTrace call.
    pub fn script_close_status(&self, status: u32) {
        self.inner.lock().unwrap().close_statuses.push_back(status);
    }

    /// Makes the next OpenTrace call fail.
    pub fn fail_next_open(&self) {
        self.inner.lock().unwrap().fail_next_open = true;
    }

    /// Seeds the registration handle a query reports, as if another
    /// process had started the session.
    pub fn set_query_historical_context(&self, handle: u64) {
        self.inner.lock().unwrap().query_historical_context = handle;
    }

    /// Seeds the counters a query reports.
    pub fn set_query_counters(
        &self,
        events_lost: u32,
        buffers_written: u32,
        free_buffers: u32,
        buffers_lost: u32,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.query_events_lost = events_lost;
        inner.query_buffers_written = buffers_written;
        inner.query_free_buffers = free_buffers;
        inner.query_buffers_lost = buffers_lost;
    }

    /// Teaches the metadata resolver that events published under
    /// `message_id` really belong to `provider_id`.
    pub fn map_classic_provider(&self, message_id: Guid, provider_id: Guid) {
        self.inner.lock().unwrap().classic_map.insert(message_id, provider_id);
    }

    pub fn start_calls(&self) -> usize {
        self.inner.lock().unwrap().start_calls
    }

    pub fn open_calls(&self) -> usize {
        self.inner.lock().unwrap().open_calls
    }

    pub fn close_calls(&self) -> usize {
        self.inner.lock().unwrap().close_calls
    }

    /// Control codes in call order.
    pub fn control_calls(&self) -> Vec<u32> {
        self.inner.lock().unwrap().control_calls.clone()
    }

    /// Every observed EnableTraceEx2 call, in order.
    pub fn enables(&self) -> Vec<EnableCall> {
        self.inner.lock().unwrap().enables.clone()
    }

    pub fn trace_information_classes(&self) -> Vec<u32> {
        self.inner.lock().unwrap().trace_information_classes.clone()
    }

    /// The kernel enable flags carried by the last registration.
    pub fn last_start_enable_flags(&self) -> u32 {
        self.inner.lock().unwrap().last_start_enable_flags
    }

    /// The kernel enable flags carried by the last control call.
    pub fn last_control_enable_flags(&self) -> u32 {
        self.inner.lock().unwrap().last_control_enable_flags
    }

    /// Blocks until a thread is inside the processing loop.
    pub fn wait_for_processing(&self, timeout: Duration) {
        let inner = self.inner.lock().unwrap();
        let (_inner, result) = self
            .signal
            .wait_timeout_while(inner, timeout, |inner| !inner.processing)
            .unwrap();
        assert!(!result.timed_out(), "no thread entered the processing loop");
    }

    /// Blocks until `count` events have been delivered.
    pub fn wait_for_events(&self, count: u64, timeout: Duration) {
        let inner = self.inner.lock().unwrap();
        let (_inner, result) = self
            .signal
            .wait_timeout_while(inner, timeout, |inner| inner.events_delivered < count)
            .unwrap();
        assert!(!result.timed_out(), "expected {count} events to be delivered");
    }

    /// Delivers a raw record through the event callback captured at open
    /// time, exactly as the subsystem would on a processing thread.
    pub fn inject_event(&self, record: &EVENT_RECORD) {
        let (callback, context) = {
            let inner = self.inner.lock().unwrap();
            (inner.event_callback, inner.context)
        };
        let Some(callback) = callback else {
            panic!("no event callback captured; open the trace first");
        };
        let mut delivered = *record;
        delivered.UserContext = context as *mut core::ffi::c_void;
        // SAFETY: the record is live for the duration of the call and the
        // callback is the fixed trampoline captured from OpenTrace.
        unsafe { callback(&mut delivered) };
        let mut inner = self.inner.lock().unwrap();
        inner.events_delivered += 1;
        self.signal.notify_all();
    }
}

impl TraceSubsystem for FakeSubsystem {
    fn start_trace(&self, info: &mut TraceInfo) -> (u32, TRACEHANDLE) {
        let mut inner = self.inner.lock().unwrap();
        inner.start_calls += 1;
        inner.last_start_enable_flags = info.properties.EnableFlags;
        let status = inner.start_statuses.pop_front().unwrap_or(ERROR_SUCCESS);
        if status != ERROR_SUCCESS {
            return (status, INVALID_PROCESSTRACE_HANDLE);
        }
        inner.next_handle += 1;
        (ERROR_SUCCESS, inner.next_handle)
    }

    fn control_trace(
        &self,
        _handle: TRACEHANDLE,
        _name: &[u16],
        info: &mut TraceInfo,
        control: u32,
    ) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.control_calls.push(control);
        inner.last_control_enable_flags = info.properties.EnableFlags;
        let status = inner
            .control_statuses
            .get_mut(&control)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(ERROR_SUCCESS);
        if status != ERROR_SUCCESS {
            return status;
        }
        match control {
            EVENT_TRACE_CONTROL_QUERY => {
                info.properties.EventsLost = inner.query_events_lost;
                info.properties.BuffersWritten = inner.query_buffers_written;
                info.properties.FreeBuffers = inner.query_free_buffers;
                info.properties.LogBuffersLost = inner.query_buffers_lost;
                info.properties.Wnode.HistoricalContext = inner.query_historical_context;
            }
            EVENT_TRACE_CONTROL_STOP => {
                inner.process_released = true;
                inner.process_status = ERROR_SUCCESS;
                self.signal.notify_all();
            }
            _ => {}
        }
        ERROR_SUCCESS
    }

    fn enable_trace(
        &self,
        _session: TRACEHANDLE,
        provider: &Guid,
        control: u32,
        level: u8,
        any: u64,
        all: u64,
        parameters: &ENABLE_TRACE_PARAMETERS,
    ) -> u32 {
        let filter_types = if parameters.FilterDescCount > 0 {
            // SAFETY: the caller keeps the descriptor array alive across
            // this call, as the real API requires.
            let descriptors = unsafe {
                std::slice::from_raw_parts(
                    parameters.EnableFilterDesc,
                    parameters.FilterDescCount as usize,
                )
            };
            descriptors.iter().map(|d| d.Type).collect()
        } else {
            Vec::new()
        };
        let mut inner = self.inner.lock().unwrap();
        inner.enables.push(EnableCall {
            provider: *provider,
            control,
            level,
            any,
            all,
            properties: parameters.EnableProperty,
            filter_types,
        });
        ERROR_SUCCESS
    }

    fn open_trace(&self, logfile: &mut EVENT_TRACE_LOGFILEW) -> TRACEHANDLE {
        let mut inner = self.inner.lock().unwrap();
        inner.open_calls += 1;
        if inner.fail_next_open {
            inner.fail_next_open = false;
            return INVALID_PROCESSTRACE_HANDLE;
        }
        inner.event_callback = logfile.EventRecordCallback;
        inner.context = logfile.Context as usize;
        inner.next_handle += 1;
        inner.next_handle
    }

    fn process_trace(
        &self,
        _handle: TRACEHANDLE,
        _start: Option<FILETIME>,
        _end: Option<FILETIME>,
    ) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        // A release left behind by an earlier close belongs to the previous
        // pump; a fresh pump blocks until it is released itself.
        inner.process_released = false;
        inner.processing = true;
        self.signal.notify_all();
        while !inner.process_released {
            inner = self.signal.wait(inner).unwrap();
        }
        inner.process_released = false;
        inner.processing = false;
        inner.process_status
    }

    fn close_trace(&self, _handle: TRACEHANDLE) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.close_calls += 1;
        // Closing the processing handle also unwinds a blocked pump.
        inner.process_released = true;
        self.signal.notify_all();
        inner.close_statuses.pop_front().unwrap_or(ERROR_SUCCESS)
    }

    fn set_trace_information(&self, _session: TRACEHANDLE, class: u32, _data: &[u8]) -> u32 {
        self.inner.lock().unwrap().trace_information_classes.push(class);
        ERROR_SUCCESS
    }

    fn resolve_provider(&self, record: &EVENT_RECORD) -> Option<Guid> {
        let message_id = Guid::from_abi(record.EventHeader.ProviderId);
        self.inner.lock().unwrap().classic_map.get(&message_id).copied()
    }

    fn aggregate_payload_filter(
        &self,
        _provider: &Guid,
        predicate: &PayloadPredicate,
        _manifest: Option<&Path>,
    ) -> Result<AssembledPayloadFilter, TraceError> {
        // An opaque stand-in blob; real aggregation happens in TDH.
        let mut buffer = predicate.field.as_bytes().to_vec();
        buffer.push(0);
        buffer.extend_from_slice(predicate.value.as_bytes());
        let descriptor = EVENT_FILTER_DESCRIPTOR {
            Ptr: buffer.as_ptr() as u64,
            Size: buffer.len() as u32,
            Type: EVENT_FILTER_TYPE_PAYLOAD,
        };
        Ok(AssembledPayloadFilter {
            descriptor,
            storage: PayloadStorage::Owned(buffer),
        })
    }
}

/// Builder for raw event records, for pushing through the dispatch path.
pub struct SynthRecord {
    record: EVENT_RECORD,
    payload: Vec<u8>,
}

impl SynthRecord {
    pub fn new(provider: Guid) -> Self {
        let mut record = EVENT_RECORD::default();
        record.EventHeader.ProviderId = *provider.as_abi();
        record.EventHeader.Size = std::mem::size_of::<EVENT_HEADER>() as u16;
        Self {
            record,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn event_id(mut self, id: u16) -> Self {
        self.record.EventHeader.EventDescriptor.Id = id;
        self
    }

    #[must_use]
    pub fn version(mut self, version: u8) -> Self {
        self.record.EventHeader.EventDescriptor.Version = version;
        self
    }

    #[must_use]
    pub fn opcode(mut self, opcode: u8) -> Self {
        self.record.EventHeader.EventDescriptor.Opcode = opcode;
        self
    }

    #[must_use]
    pub fn level(mut self, level: u8) -> Self {
        self.record.EventHeader.EventDescriptor.Level = level;
        self
    }

    #[must_use]
    pub fn keyword(mut self, keyword: u64) -> Self {
        self.record.EventHeader.EventDescriptor.Keyword = keyword;
        self
    }

    #[must_use]
    pub fn process_id(mut self, pid: u32) -> Self {
        self.record.EventHeader.ProcessId = pid;
        self
    }

    #[must_use]
    pub fn thread_id(mut self, tid: u32) -> Self {
        self.record.EventHeader.ThreadId = tid;
        self
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.record.EventHeader.TimeStamp = timestamp;
        self
    }

    /// Marks the record as published through the legacy provider ABI.
    #[must_use]
    pub fn classic(mut self) -> Self {
        self.record.EventHeader.Flags |= EVENT_HEADER_FLAG_CLASSIC_HEADER;
        self
    }

    #[must_use]
    pub fn payload(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = bytes.into();
        self
    }

    /// Finalizes the record. The returned value owns the payload storage
    /// the record points into, so it can move freely.
    pub fn build(self) -> OwnedRecord {
        let mut record = self.record;
        let payload = self.payload.into_boxed_slice();
        if !payload.is_empty() {
            record.UserData = payload.as_ptr() as *mut core::ffi::c_void;
            record.UserDataLength = payload.len() as u16;
        }
        OwnedRecord {
            record,
            _payload: payload,
        }
    }
}

/// A raw record plus the heap storage its payload pointer targets.
pub struct OwnedRecord {
    record: EVENT_RECORD,
    _payload: Box<[u8]>,
}

impl std::ops::Deref for OwnedRecord {
    type Target = EVENT_RECORD;

    fn deref(&self) -> &EVENT_RECORD {
        &self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EventRecord;

    #[test]
    fn synth_record_carries_its_payload() {
        let raw = SynthRecord::new(Guid::random())
            .event_id(7)
            .payload(vec![0xde, 0xad, 0xbe, 0xef])
            .build();
        // SAFETY: OwnedRecord keeps the payload alive alongside the record.
        let record = unsafe { EventRecord::from_raw(&raw) };
        assert_eq!(record.event_id(), 7);
        assert_eq!(record.user_data(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn scripted_statuses_are_consumed_in_order() {
        let fake = FakeSubsystem::new();
        fake.script_start_status(ERROR_ACCESS_DENIED);
        let mut info = TraceInfo::default();
        let (status, handle) = fake.start_trace(&mut info);
        assert_eq!(status, ERROR_ACCESS_DENIED);
        assert_eq!(handle, INVALID_PROCESSTRACE_HANDLE);
        let (status, handle) = fake.start_trace(&mut info);
        assert_eq!(status, ERROR_SUCCESS);
        assert_ne!(handle, INVALID_PROCESSTRACE_HANDLE);
        assert_eq!(fake.start_calls(), 2);
    }

    #[test]
    fn query_reports_seeded_counters() {
        let fake = FakeSubsystem::new();
        fake.set_query_counters(9, 12, 3, 1);
        let mut info = TraceInfo::default();
        let status = fake.control_trace(0, &[0], &mut info, EVENT_TRACE_CONTROL_QUERY);
        assert_eq!(status, ERROR_SUCCESS);
        assert_eq!(info.properties.EventsLost, 9);
        assert_eq!(info.properties.BuffersWritten, 12);
        assert_eq!(info.properties.FreeBuffers, 3);
        assert_eq!(info.properties.LogBuffersLost, 1);
    }
}
