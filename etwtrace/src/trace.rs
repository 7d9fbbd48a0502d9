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

//! The public trace-session surface.
//!
//! A [`Trace`] is constructed dormant, accumulates providers via
//! [`enable`](Trace::enable), and goes live with [`start`](Trace::start)
//! (which blocks the calling thread inside the subsystem's pull loop) or
//! the manual [`open`](Trace::open)/[`process`](Trace::process) pair.
//! `stop`, `enable` and `disable` may be called from other threads while a
//! worker is blocked processing.

use crate::dispatch::TraceKind;
use crate::error::{check_status, TraceError};
use crate::guid::Guid;
use crate::provider::EventCallback;
use crate::record::EventRecord;
use crate::session::{SessionController, SessionState};
use crate::subsystem::{
    self, platform_subsystem, SessionSlot, TraceInfo, TraceSubsystem,
};
use etwtrace_sys::*;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Buffering configuration applied at registration and by
/// [`Trace::update`]. Zero values leave the subsystem default in place.
#[derive(Clone, Debug)]
pub struct TraceProperties {
    /// Per-buffer size in KiB.
    pub buffer_size_kb: u32,
    pub minimum_buffers: u32,
    pub maximum_buffers: u32,
    /// How often partially-filled buffers are flushed, in seconds.
    pub flush_timer_secs: u32,
    /// Log-file-mode bits. Kind-specific bits are added on top.
    pub log_file_mode: u32,
    /// Capture-file sink. Events are persisted here instead of (or in
    /// addition to, depending on mode bits) real-time delivery.
    pub log_file: Option<PathBuf>,
}

impl Default for TraceProperties {
    fn default() -> Self {
        Self {
            buffer_size_kb: 64,
            minimum_buffers: 0,
            maximum_buffers: 0,
            flush_timer_secs: 1,
            log_file_mode: EVENT_TRACE_REAL_TIME_MODE,
            log_file: None,
        }
    }
}

/// Read-only snapshot of session counters: the subsystem-reported buffer
/// and loss figures merged with this client's dispatch counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub buffer_count: u32,
    pub buffers_free: u32,
    pub buffers_written: u32,
    pub buffers_lost: u32,
    pub events_lost: u32,
    /// Events this client dispatched, counted once per delivery.
    pub events_handled: u64,
    /// `events_handled + events_lost`. The subsystem keeps no running
    /// total of its own.
    pub events_total: u64,
    /// Buffers consumed by the processing loop.
    pub buffers_processed: u64,
}

/// A trace session over the kind `K`. Cloning is shallow; clones share the
/// same session, which is how `stop` reaches a session another thread is
/// blocked processing.
pub struct Trace<K: TraceKind> {
    inner: Arc<Inner<K>>,
}

/// Session over user-registered providers.
pub type UserTrace = Trace<crate::dispatch::UserMode>;

/// Session over the fixed kernel producers.
pub type KernelTrace = Trace<crate::dispatch::KernelMode>;

impl<K: TraceKind> Clone for Trace<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<K: TraceKind> {
    subsystem: Arc<dyn TraceSubsystem>,
    state: Mutex<SessionState>,
    providers: Mutex<K::Registry>,
    default_callback: Mutex<Option<EventCallback>>,
    events_handled: AtomicU64,
    buffers_processed: AtomicU64,
    _kind: PhantomData<K>,
}

impl<K: TraceKind> Trace<K> {
    /// Creates a dormant session with default buffering. An empty name is
    /// replaced per the kind's naming policy.
    pub fn new(name: &str) -> Self {
        Self::with_properties(name, TraceProperties::default())
    }

    /// Creates a dormant session with explicit buffering configuration.
    pub fn with_properties(name: &str, properties: TraceProperties) -> Self {
        Self::with_subsystem(name, properties, platform_subsystem())
    }

    /// Creates a dormant session over an explicit subsystem implementation.
    /// This is the seam the fake subsystem in [`crate::testing`] plugs into.
    pub fn with_subsystem(
        name: &str,
        properties: TraceProperties,
        subsystem: Arc<dyn TraceSubsystem>,
    ) -> Self {
        let effective = K::effective_name(name);
        let mut info = TraceInfo::default();
        info.properties.Wnode.Guid = *K::session_guid().as_abi();
        info.properties.Wnode.ClientContext = 1; // QPC timestamps
        info.properties.Wnode.Flags = WNODE_FLAG_TRACED_GUID;
        apply_properties(&mut info, &properties);
        info.set_trace_name(&effective);

        Self {
            inner: Arc::new(Inner {
                subsystem,
                state: Mutex::new(SessionState::new(effective, info)),
                providers: Mutex::new(K::Registry::default()),
                default_callback: Mutex::new(None),
                events_handled: AtomicU64::new(0),
                buffers_processed: AtomicU64::new(0),
                _kind: PhantomData,
            }),
        }
    }

    /// Creates a session that replays a persisted capture file instead of
    /// registering for live delivery.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let trace = Self::new(&path.display().to_string());
        trace.inner.state.lock().unwrap().file_source =
            Some(path.to_string_lossy().encode_utf16().chain([0]).collect());
        trace
    }

    /// The session name the subsystem sees.
    pub fn name(&self) -> String {
        self.inner.state.lock().unwrap().name.clone()
    }

    /// Attaches a provider, merging with any earlier attachment of the
    /// same identity. On a live session the merged enablement is pushed to
    /// the subsystem immediately; on a dormant one it is deferred until
    /// registration.
    pub fn enable(&self, provider: K::Provider) -> Result<(), TraceError> {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        let mut providers = self.inner.providers.lock().unwrap();
        let id = K::attach(&mut providers, provider);

        // A session opened over an externally-started registration has a
        // processing handle but no registration handle; adopt the foreign
        // one so the enablement can be pushed live.
        if !state.is_registered() && state.is_open() && state.file_source.is_none() {
            let _ = SessionController::new(&*self.inner.subsystem, state).adopt_registration();
        }
        if state.is_registered() {
            let session = state.registration;
            K::enable_one(
                &mut providers,
                &id,
                session,
                &mut state.info,
                &state.name_utf16,
                &*self.inner.subsystem,
            )?;
        }
        Ok(())
    }

    /// Detaches an identity and disables it natively. Detaching an identity
    /// that was never attached is a no-op; detaching from a session that
    /// was never registered is an ordering error.
    pub fn disable(&self, id: Guid) -> Result<(), TraceError> {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        let mut providers = self.inner.providers.lock().unwrap();
        if !K::contains(&providers, &id) {
            return Ok(());
        }
        // A rejected disable must leave the attachment in place, so the
        // ordering check runs before anything is removed.
        if !state.is_registered() {
            return Err(TraceError::NotRegistered);
        }
        K::detach(&mut providers, &id);
        let status = K::disable_one(
            &providers,
            &id,
            state.registration,
            &mut state.info,
            &state.name_utf16,
            &*self.inner.subsystem,
        );
        match check_status(status) {
            Ok(()) | Err(TraceError::Native(ERROR_WMI_INSTANCE_NOT_FOUND)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Installs the callback that receives events no attached provider
    /// claims. Without one, unclaimed events are counted and dropped.
    pub fn set_default_callback(
        &self,
        callback: impl Fn(&EventRecord<'_>) + Send + Sync + 'static,
    ) {
        *self.inner.default_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Registers and opens the session without pumping, for callers that
    /// drive [`process`](Trace::process) themselves. Marks the session
    /// non-stoppable: a plain [`stop`](Trace::stop) becomes a no-op and
    /// teardown is the caller's responsibility (or
    /// [`force_stop`](Trace::force_stop)).
    pub fn open(&self) -> Result<(), TraceError> {
        let mut state = self.inner.state.lock().unwrap();
        self.ensure_open(&mut state)?;
        state.non_stoppable = true;
        Ok(())
    }

    /// Registers, opens and pumps the session. Blocks the calling thread
    /// until another thread stops the session, a file source reaches end
    /// of data, or the subsystem fails.
    pub fn start(&self) -> Result<(), TraceError> {
        let handle;
        {
            let mut state = self.inner.state.lock().unwrap();
            self.ensure_open(&mut state)?;
            self.request_rundowns(&state)?;
            handle = state.processing;
        }
        self.pump(handle, None, None)
    }

    /// Pumps an already-opened session, optionally bounded to a time
    /// window. The window only means something for file-backed or
    /// historical processing. Requires [`open`](Trace::open) first.
    pub fn process(
        &self,
        start: Option<FILETIME>,
        end: Option<FILETIME>,
    ) -> Result<(), TraceError> {
        let handle;
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.is_open() {
                return Err(TraceError::OpenFailure);
            }
            self.request_rundowns(&state)?;
            handle = state.processing;
        }
        self.pump(handle, start, end)
    }

    /// Stops the session and tears down its subsystem state. Idempotent.
    /// No-op on a session made non-stoppable by [`open`](Trace::open).
    pub fn stop(&self) -> Result<(), TraceError> {
        self.stop_impl(false)
    }

    /// Stops the session even when it was marked non-stoppable.
    pub fn force_stop(&self) -> Result<(), TraceError> {
        self.stop_impl(true)
    }

    /// Releases the processing handle without stopping the session.
    pub fn close(&self) -> Result<(), TraceError> {
        let mut state = self.inner.state.lock().unwrap();
        SessionController::new(&*self.inner.subsystem, &mut state).close()?;
        Self::drop_slot(&mut state);
        Ok(())
    }

    /// Applies a new buffering configuration to the live session.
    pub fn update(&self, properties: &TraceProperties) -> Result<(), TraceError> {
        let mut state = self.inner.state.lock().unwrap();
        apply_properties(&mut state.info, properties);
        SessionController::new(&*self.inner.subsystem, &mut state).update()
    }

    /// Forces the session's filled buffers out to their consumers without
    /// waiting for the flush timer.
    pub fn flush(&self) -> Result<(), TraceError> {
        let mut state = self.inner.state.lock().unwrap();
        SessionController::new(&*self.inner.subsystem, &mut state).flush()
    }

    /// Switches a file-sink session to live delivery.
    pub fn transition_to_realtime(&self) -> Result<(), TraceError> {
        let mut state = self.inner.state.lock().unwrap();
        SessionController::new(&*self.inner.subsystem, &mut state).transition_to_realtime()
    }

    /// Applies a trace-information class (stack tracing and friends) to the
    /// registered session.
    pub fn set_trace_information(&self, class: u32, data: &[u8]) -> Result<(), TraceError> {
        let mut state = self.inner.state.lock().unwrap();
        SessionController::new(&*self.inner.subsystem, &mut state).set_trace_information(class, data)
    }

    /// Queries the subsystem for the current counters and merges them with
    /// this client's dispatch counters.
    pub fn query_stats(&self) -> Result<TraceStats, TraceError> {
        let mut state = self.inner.state.lock().unwrap();
        let snapshot = SessionController::new(&*self.inner.subsystem, &mut state).query()?;
        drop(state);

        let p = &snapshot.properties;
        let events_handled = self.inner.events_handled.load(Ordering::Relaxed);
        Ok(TraceStats {
            buffer_count: p.NumberOfBuffers,
            buffers_free: p.FreeBuffers,
            buffers_written: p.BuffersWritten,
            buffers_lost: p.LogBuffersLost + p.RealTimeBuffersLost,
            events_lost: p.EventsLost,
            events_handled,
            events_total: events_handled + u64::from(p.EventsLost),
            buffers_processed: self.inner.buffers_processed.load(Ordering::Relaxed),
        })
    }

    /// Buffers consumed by the processing loop so far.
    pub fn buffers_processed(&self) -> u64 {
        self.inner.buffers_processed.load(Ordering::Relaxed)
    }

    /// Events dispatched by this client so far.
    pub fn events_handled(&self) -> u64 {
        self.inner.events_handled.load(Ordering::Relaxed)
    }

    fn stop_impl(&self, force: bool) -> Result<(), TraceError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.non_stoppable && !force {
            return Ok(());
        }
        SessionController::new(&*self.inner.subsystem, &mut state).stop()?;
        Self::drop_slot(&mut state);
        state.non_stoppable = false;
        Ok(())
    }

    // Registers (recovering per the documented ladder), pushes every merged
    // enablement, and opens the processing handle. File-backed sessions
    // skip registration entirely.
    fn ensure_open(&self, state: &mut SessionState) -> Result<(), TraceError> {
        if state.is_open() {
            return Ok(());
        }
        if state.file_source.is_none() && !state.is_registered() {
            {
                let providers = self.inner.providers.lock().unwrap();
                K::augment(&mut state.info, &providers);
            }
            SessionController::new(&*self.inner.subsystem, state).register()?;
            if state.is_registered() {
                let mut providers = self.inner.providers.lock().unwrap();
                let session = state.registration;
                K::enable_all(
                    &mut providers,
                    session,
                    &mut state.info,
                    &state.name_utf16,
                    &*self.inner.subsystem,
                )?;
            }
        }

        let key = subsystem::register_session(self.make_slot());
        match SessionController::new(&*self.inner.subsystem, state).open(key) {
            Ok(()) => Ok(()),
            Err(err) => {
                subsystem::unregister_session(key);
                state.context_key = 0;
                Err(err)
            }
        }
    }

    // Capture-state requests go out after registration but before the
    // first pump, so rundown events land at the head of the stream.
    fn request_rundowns(&self, state: &SessionState) -> Result<(), TraceError> {
        if !state.is_registered() {
            return Ok(());
        }
        let providers = self.inner.providers.lock().unwrap();
        K::request_rundowns(&providers, state.registration, &*self.inner.subsystem)
    }

    fn pump(
        &self,
        handle: TRACEHANDLE,
        start: Option<FILETIME>,
        end: Option<FILETIME>,
    ) -> Result<(), TraceError> {
        // Dispatch counters describe one run of the pump, not the lifetime
        // of the handle.
        self.inner.events_handled.store(0, Ordering::Relaxed);
        let status = self.inner.subsystem.process_trace(handle, start, end);
        let result = match status {
            ERROR_CANCELLED => Ok(()),
            other => check_status(other),
        };
        // If the pump returned on its own (EOF or error) the processing
        // handle is still live; release it. A concurrent stop() already
        // reset the state and this is a no-op.
        let mut state = self.inner.state.lock().unwrap();
        if state.processing == handle {
            let _ = SessionController::new(&*self.inner.subsystem, &mut state).close();
            Self::drop_slot(&mut state);
        }
        result
    }

    fn make_slot(&self) -> SessionSlot {
        let on_event = Arc::downgrade(&self.inner);
        let on_buffer = Arc::downgrade(&self.inner);
        SessionSlot {
            on_event: Box::new(move |raw| {
                if let Some(inner) = on_event.upgrade() {
                    inner.handle_event(raw);
                }
            }),
            on_buffer: Box::new(move |_logfile| match on_buffer.upgrade() {
                Some(inner) => {
                    inner.buffers_processed.fetch_add(1, Ordering::Relaxed);
                    true
                }
                None => false,
            }),
        }
    }

    fn drop_slot(state: &mut SessionState) {
        if state.context_key != 0 {
            subsystem::unregister_session(state.context_key);
            state.context_key = 0;
        }
    }
}

impl<K: TraceKind> Inner<K> {
    fn handle_event(&self, raw: &EVENT_RECORD) {
        // Counted once per delivery, dispatched or not.
        self.events_handled.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the subsystem keeps the record alive for this delivery.
        let record = unsafe { EventRecord::from_raw(raw) };
        let handled = {
            let providers = self.providers.lock().unwrap();
            K::forward(&providers, &record, &*self.subsystem)
        };
        if !handled {
            if let Some(callback) = self.default_callback.lock().unwrap().as_ref() {
                callback(&record);
            }
        }
    }
}

impl<K: TraceKind> Drop for Inner<K> {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = if state.non_stoppable {
            SessionController::new(&*self.subsystem, state).close()
        } else {
            SessionController::new(&*self.subsystem, state).stop()
        };
        if let Err(err) = result {
            log::warn!("failed to tear down trace session {:?}: {err}", state.name);
        }
        if state.context_key != 0 {
            subsystem::unregister_session(state.context_key);
        }
    }
}

fn apply_properties(info: &mut TraceInfo, properties: &TraceProperties) {
    info.properties.BufferSize = properties.buffer_size_kb;
    info.properties.MinimumBuffers = properties.minimum_buffers;
    info.properties.MaximumBuffers = properties.maximum_buffers;
    info.properties.FlushTimer = properties.flush_timer_secs;
    info.properties.LogFileMode = properties.log_file_mode;
    if let Some(path) = &properties.log_file {
        info.set_logfile_name(&path.to_string_lossy());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::kernel_guids;
    use crate::provider::{KernelProvider, Provider};
    use crate::testing::{FakeSubsystem, SynthRecord};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn user_trace(name: &str, fake: &Arc<FakeSubsystem>) -> UserTrace {
        UserTrace::with_subsystem(name, TraceProperties::default(), Arc::clone(fake) as _)
    }

    #[test]
    fn dormant_enable_defers_the_native_call() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("deferred", &fake);
        trace.enable(Provider::new(Guid::random()).any(0x1)).unwrap();
        assert!(fake.enables().is_empty());
    }

    #[test]
    fn open_enables_merged_providers_and_marks_non_stoppable() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("manual", &fake);
        let id = Guid::random();
        trace.enable(Provider::new(id).level(4).any(0x10)).unwrap();
        trace.enable(Provider::new(id).level(2).any(0x08)).unwrap();
        trace.open().unwrap();

        let enables = fake.enables();
        assert_eq!(enables.len(), 1);
        assert_eq!(enables[0].any, 0x18);
        assert_eq!(enables[0].level, 2);

        // A plain stop is a no-op after open().
        trace.stop().unwrap();
        assert_eq!(fake.control_calls(), Vec::<u32>::new());
        trace.force_stop().unwrap();
        assert_eq!(fake.control_calls(), vec![EVENT_TRACE_CONTROL_STOP]);
    }

    #[test]
    fn live_enable_pushes_immediately() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("live", &fake);
        trace.open().unwrap();
        trace.enable(Provider::new(Guid::random()).any(0x4)).unwrap();
        assert_eq!(fake.enables().len(), 1);
        trace.force_stop().unwrap();
    }

    #[test]
    fn disable_before_registration_is_an_ordering_error() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("ordering", &fake);
        let id = Guid::random();
        trace.enable(Provider::new(id)).unwrap();
        assert_eq!(trace.disable(id), Err(TraceError::NotRegistered));

        // The rejected disable left the attachment in place.
        trace.open().unwrap();
        let enables = fake.enables();
        assert_eq!(enables.len(), 1);
        assert_eq!(enables[0].provider, id);
        trace.force_stop().unwrap();
    }

    #[test]
    fn disable_of_an_unknown_identity_is_a_no_op() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("unknown", &fake);
        trace.disable(Guid::random()).unwrap();
    }

    #[test]
    fn stop_is_idempotent_without_a_session() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("idempotent", &fake);
        trace.stop().unwrap();
        trace.stop().unwrap();
    }

    #[test]
    fn stats_merge_local_and_subsystem_counters() {
        let fake = Arc::new(FakeSubsystem::new());
        fake.set_query_counters(3, 40, 2, 5);
        let trace = user_trace("counted", &fake);

        // Deliver two events through the dispatch path.
        let id = Guid::random();
        trace.enable(Provider::new(id)).unwrap();
        let worker = {
            let trace = trace.clone();
            std::thread::spawn(move || trace.start())
        };
        fake.wait_for_processing(Duration::from_secs(5));
        fake.inject_event(&SynthRecord::new(id).build());
        fake.inject_event(&SynthRecord::new(Guid::random()).build());
        fake.wait_for_events(2, Duration::from_secs(5));

        let stats = trace.query_stats().unwrap();
        assert_eq!(stats.events_lost, 3);
        assert_eq!(stats.buffers_written, 40);
        assert_eq!(stats.events_handled, 2);
        assert_eq!(stats.events_total, stats.events_handled + u64::from(stats.events_lost));

        trace.stop().unwrap();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn default_callback_sees_unclaimed_events_exactly_once() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("fallback", &fake);
        let claimed = Arc::new(AtomicUsize::new(0));
        let unclaimed = Arc::new(AtomicUsize::new(0));

        let id = Guid::random();
        let counter = Arc::clone(&claimed);
        trace
            .enable(Provider::new(id).add_callback(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        let counter = Arc::clone(&unclaimed);
        trace.set_default_callback(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let worker = {
            let trace = trace.clone();
            std::thread::spawn(move || trace.start())
        };
        fake.wait_for_processing(Duration::from_secs(5));
        fake.inject_event(&SynthRecord::new(id).build());
        fake.inject_event(&SynthRecord::new(Guid::random()).build());
        fake.wait_for_events(2, Duration::from_secs(5));

        assert_eq!(claimed.load(Ordering::Relaxed), 1);
        assert_eq!(unclaimed.load(Ordering::Relaxed), 1);

        trace.stop().unwrap();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn live_enable_while_processing_dispatches_new_provider() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("T", &fake);

        let g1 = Guid::random();
        let g2 = Guid::random();
        trace.enable(Provider::new(g1).any(0x10)).unwrap();

        let worker = {
            let trace = trace.clone();
            std::thread::spawn(move || trace.start())
        };
        fake.wait_for_processing(Duration::from_secs(5));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        trace
            .enable(Provider::new(g2).any(0x08).add_callback(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        assert_eq!(fake.enables().len(), 2);

        fake.inject_event(&SynthRecord::new(g2).build());
        fake.wait_for_events(1, Duration::from_secs(5));
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        trace.stop().unwrap();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn rundown_requests_precede_processing() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("rundown", &fake);
        let id = Guid::random();
        trace.enable(Provider::new(id).rundown()).unwrap();

        let worker = {
            let trace = trace.clone();
            std::thread::spawn(move || trace.start())
        };
        fake.wait_for_processing(Duration::from_secs(5));

        let captures: Vec<_> = fake
            .enables()
            .into_iter()
            .filter(|e| e.control == EVENT_CONTROL_CODE_CAPTURE_STATE)
            .collect();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].provider, id);

        trace.stop().unwrap();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn kernel_trace_carries_enable_flags_in_registration() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = KernelTrace::with_subsystem(
            "whatever",
            TraceProperties::default(),
            Arc::clone(&fake) as _,
        );
        assert_eq!(trace.name(), KERNEL_LOGGER_NAME);

        trace.enable(KernelProvider::process()).unwrap();
        trace.enable(KernelProvider::image_load()).unwrap();
        trace.open().unwrap();

        assert_eq!(
            fake.last_start_enable_flags(),
            EVENT_TRACE_FLAG_PROCESS | EVENT_TRACE_FLAG_IMAGE_LOAD
        );
        // Kernel producers ride the registration block, not EnableTraceEx2.
        assert!(fake.enables().is_empty());
        trace.force_stop().unwrap();
    }

    #[test]
    fn kernel_live_attach_updates_the_flag_set() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = KernelTrace::with_subsystem(
            "",
            TraceProperties::default(),
            Arc::clone(&fake) as _,
        );
        trace.enable(KernelProvider::process()).unwrap();
        trace.open().unwrap();
        trace.enable(KernelProvider::registry()).unwrap();

        assert_eq!(fake.control_calls(), vec![EVENT_TRACE_CONTROL_UPDATE]);
        assert_eq!(
            fake.last_control_enable_flags(),
            EVENT_TRACE_FLAG_PROCESS | EVENT_TRACE_FLAG_REGISTRY
        );
        trace.force_stop().unwrap();
    }

    #[test]
    fn kernel_live_detach_updates_the_flag_set() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = KernelTrace::with_subsystem(
            "",
            TraceProperties::default(),
            Arc::clone(&fake) as _,
        );
        trace.enable(KernelProvider::process()).unwrap();
        trace.enable(KernelProvider::registry()).unwrap();
        trace.open().unwrap();

        trace.disable(kernel_guids::REGISTRY).unwrap();
        assert_eq!(fake.control_calls(), vec![EVENT_TRACE_CONTROL_UPDATE]);
        assert_eq!(fake.last_control_enable_flags(), EVENT_TRACE_FLAG_PROCESS);
        trace.force_stop().unwrap();
    }

    #[test]
    fn flush_pushes_filled_buffers_on_demand() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("flushed", &fake);
        assert_eq!(trace.flush(), Err(TraceError::NotRegistered));

        trace.open().unwrap();
        trace.flush().unwrap();
        assert_eq!(fake.control_calls(), vec![EVENT_TRACE_CONTROL_FLUSH]);
        trace.force_stop().unwrap();
    }

    #[test]
    fn restart_counts_events_per_run() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = user_trace("restarted", &fake);
        let id = Guid::random();
        trace.enable(Provider::new(id)).unwrap();

        for expected_total in 1..=2u64 {
            let worker = {
                let trace = trace.clone();
                std::thread::spawn(move || trace.start())
            };
            fake.wait_for_processing(Duration::from_secs(5));
            fake.inject_event(&SynthRecord::new(id).build());
            fake.wait_for_events(expected_total, Duration::from_secs(5));

            // One event per run, however many runs came before.
            assert_eq!(trace.events_handled(), 1);

            trace.stop().unwrap();
            worker.join().unwrap().unwrap();
        }
    }

    #[test]
    fn kernel_events_route_to_their_producer() {
        let fake = Arc::new(FakeSubsystem::new());
        let trace = KernelTrace::with_subsystem(
            "",
            TraceProperties::default(),
            Arc::clone(&fake) as _,
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        trace
            .enable(KernelProvider::process().add_callback(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();

        let worker = {
            let trace = trace.clone();
            std::thread::spawn(move || trace.start())
        };
        fake.wait_for_processing(Duration::from_secs(5));
        fake.inject_event(&SynthRecord::new(kernel_guids::PROCESS).build());
        fake.inject_event(&SynthRecord::new(kernel_guids::THREAD).build());
        fake.wait_for_events(2, Duration::from_secs(5));
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        trace.stop().unwrap();
        worker.join().unwrap().unwrap();
    }
}
