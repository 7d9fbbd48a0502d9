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

use crate::{filter::EventFilter, guid::Guid, record::EventRecord};
use bitflags::bitflags;
use etwtrace_sys::*;
use std::collections::BTreeSet;
use std::fmt;

bitflags! {
    /// Extra per-event data the subsystem can attach when a provider is
    /// enabled with the corresponding bit set.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EnableProperty: u32 {
        /// Deliver the emitting process's security identifier.
        const SID = EVENT_ENABLE_PROPERTY_SID;
        /// Deliver the terminal session id.
        const TS_ID = EVENT_ENABLE_PROPERTY_TS_ID;
        /// Capture a call stack with each event.
        const STACK_TRACE = EVENT_ENABLE_PROPERTY_STACK_TRACE;
        /// Deliver events regardless of keyword when keyword is zero.
        const IGNORE_KEYWORD_0 = EVENT_ENABLE_PROPERTY_IGNORE_KEYWORD_0;
        /// Enable the whole provider group, not just this identity.
        const PROVIDER_GROUP = EVENT_ENABLE_PROPERTY_PROVIDER_GROUP;
        /// Deliver the process start key.
        const PROCESS_START_KEY = EVENT_ENABLE_PROPERTY_PROCESS_START_KEY;
        /// Deliver the unique event key.
        const EVENT_KEY = EVENT_ENABLE_PROPERTY_EVENT_KEY;
        /// Suppress events from InPrivate sessions.
        const EXCLUDE_INPRIVATE = EVENT_ENABLE_PROPERTY_EXCLUDE_INPRIVATE;
    }
}

/// Per-event callback. Invoked synchronously on the thread blocked inside
/// the processing loop; panics propagate out of that loop.
pub type EventCallback = Box<dyn Fn(&EventRecord<'_>) + Send + Sync>;

/// One attached callback, optionally restricted to a set of event ids.
pub(crate) struct CallbackSlot {
    pub ids: Option<BTreeSet<u16>>,
    pub callback: EventCallback,
}

impl CallbackSlot {
    pub fn matches(&self, event_id: u16) -> bool {
        match &self.ids {
            Some(ids) => ids.contains(&event_id),
            None => true,
        }
    }
}

impl fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSlot").field("ids", &self.ids).finish_non_exhaustive()
    }
}

/// The enablement fields handed to the subsystem for one provider identity.
///
/// The subsystem accepts a single enablement per identity per session, so
/// repeated attachments of the same identity are pre-merged with [`merge`]
/// before anything is sent natively.
///
/// [`merge`]: EnableInfo::merge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnableInfo {
    /// Severity ceiling. Last write wins on merge; levels have no union.
    pub level: u8,
    /// Match-any keyword mask, unioned on merge.
    pub any: u64,
    /// Match-all keyword mask, unioned on merge.
    pub all: u64,
    /// Enable-property bits, unioned on merge.
    pub properties: EnableProperty,
    /// Whether a capture-state request is issued before processing starts.
    pub rundown: bool,
}

impl Default for EnableInfo {
    fn default() -> Self {
        Self {
            level: TRACE_LEVEL_VERBOSE,
            any: 0,
            all: 0,
            properties: EnableProperty::empty(),
            rundown: false,
        }
    }
}

impl EnableInfo {
    /// Folds a later attachment into an earlier one. Keyword, property and
    /// rundown fields take the bitwise union; level takes the incoming
    /// value.
    pub fn merge(existing: Self, incoming: Self) -> Self {
        Self {
            level: incoming.level,
            any: existing.any | incoming.any,
            all: existing.all | incoming.all,
            properties: existing.properties | incoming.properties,
            rundown: existing.rundown || incoming.rundown,
        }
    }
}

/// Describes one user-mode event producer to attach to a trace: identity,
/// enablement fields, provider-side filters and the callbacks to run per
/// delivered event.
///
/// ```no_run
/// use etwtrace::{Provider, Guid};
///
/// let provider = Provider::new(Guid::try_parse("a669021c-c450-4609-a035-5af59af4df18").unwrap())
///     .level(4)
///     .any(0x10)
///     .add_callback(|record| println!("event {}", record.event_id()));
/// ```
pub struct Provider {
    pub(crate) id: Guid,
    pub(crate) info: EnableInfo,
    pub(crate) filters: Vec<EventFilter>,
    pub(crate) callbacks: Vec<CallbackSlot>,
}

impl Provider {
    /// Creates a provider description for `id` with verbose level, no
    /// keyword restriction and no filters.
    pub fn new(id: Guid) -> Self {
        Self {
            id,
            info: EnableInfo::default(),
            filters: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn id(&self) -> Guid {
        self.id
    }

    /// Sets the severity ceiling.
    #[must_use]
    pub fn level(mut self, level: u8) -> Self {
        self.info.level = level;
        self
    }

    /// Sets the match-any keyword mask.
    #[must_use]
    pub fn any(mut self, any: u64) -> Self {
        self.info.any = any;
        self
    }

    /// Sets the match-all keyword mask.
    #[must_use]
    pub fn all(mut self, all: u64) -> Self {
        self.info.all = all;
        self
    }

    /// Adds enable-property bits.
    #[must_use]
    pub fn enable_property(mut self, property: EnableProperty) -> Self {
        self.info.properties |= property;
        self
    }

    /// Requests a capture-state rundown before processing starts.
    #[must_use]
    pub fn rundown(mut self) -> Self {
        self.info.rundown = true;
        self
    }

    /// Attaches a provider-side filter, applied by the subsystem before
    /// delivery.
    #[must_use]
    pub fn add_filter(mut self, filter: EventFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Attaches a callback invoked for every delivered event of this
    /// provider.
    #[must_use]
    pub fn add_callback(mut self, callback: impl Fn(&EventRecord<'_>) + Send + Sync + 'static) -> Self {
        self.callbacks.push(CallbackSlot {
            ids: None,
            callback: Box::new(callback),
        });
        self
    }

    /// Attaches a callback invoked only for the listed event ids.
    #[must_use]
    pub fn add_filtered_callback(
        mut self,
        ids: impl IntoIterator<Item = u16>,
        callback: impl Fn(&EventRecord<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.push(CallbackSlot {
            ids: Some(ids.into_iter().collect()),
            callback: Box::new(callback),
        });
        self
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("filters", &self.filters.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// The merged per-identity state a session actually holds. Attaching the
/// same identity twice folds into one of these rather than duplicating.
///
/// Named by [`TraceKind::Registry`](crate::TraceKind::Registry) for
/// user-mode sessions; its contents stay internal.
pub struct Registration {
    pub(crate) id: Guid,
    pub(crate) info: EnableInfo,
    pub(crate) filters: Vec<EventFilter>,
    pub(crate) callbacks: Vec<CallbackSlot>,
    /// Packed descriptor storage from the last native enable. The subsystem
    /// retains pointers into pre-session filter buffers for the lifetime of
    /// the registration, so this lives until detach or teardown.
    pub(crate) assembled: Option<crate::filter::FilterDescriptors>,
}

impl Registration {
    pub(crate) fn from_provider(provider: Provider) -> Self {
        Self {
            id: provider.id,
            info: provider.info,
            filters: provider.filters,
            callbacks: provider.callbacks,
            assembled: None,
        }
    }

    /// Folds another attachment of the same identity into this record.
    pub(crate) fn absorb(&mut self, provider: Provider) {
        debug_assert_eq!(self.id, provider.id);
        self.info = EnableInfo::merge(self.info, provider.info);
        self.filters.extend(provider.filters);
        self.callbacks.extend(provider.callbacks);
    }

    /// Runs every callback whose sub-filter admits the record, in
    /// attachment order.
    pub(crate) fn dispatch(&self, record: &EventRecord<'_>) {
        let event_id = record.event_id();
        for slot in &self.callbacks {
            if slot.matches(event_id) {
                (slot.callback)(record);
            }
        }
    }
}

/// Describes one fixed kernel event producer: the well-known identity the
/// subsystem stamps on its events plus the session enable-flag bits that
/// turn it on. Kernel producers cannot carry descriptor filters.
pub struct KernelProvider {
    pub(crate) id: Guid,
    pub(crate) flags: u32,
    pub(crate) callbacks: Vec<CallbackSlot>,
}

macro_rules! kernel_providers {
    ($($(#[$doc:meta])* $ctor:ident => ($guid:expr, $flags:expr);)*) => {
        $(
            $(#[$doc])*
            pub fn $ctor() -> Self {
                Self::from_parts($guid, $flags)
            }
        )*
    };
}

impl KernelProvider {
    fn from_parts(id: Guid, flags: u32) -> Self {
        Self {
            id,
            flags,
            callbacks: Vec::new(),
        }
    }

    kernel_providers! {
        /// Process create/exit events and their rundowns.
        process => (crate::dispatch::kernel_guids::PROCESS, EVENT_TRACE_FLAG_PROCESS);
        /// Thread create/exit events.
        thread => (crate::dispatch::kernel_guids::THREAD, EVENT_TRACE_FLAG_THREAD);
        /// Image (module) load and unload events.
        image_load => (crate::dispatch::kernel_guids::IMAGE_LOAD, EVENT_TRACE_FLAG_IMAGE_LOAD);
        /// Disk read/write completion events.
        disk_io => (crate::dispatch::kernel_guids::DISK_IO, EVENT_TRACE_FLAG_DISK_IO);
        /// Registry access events.
        registry => (crate::dispatch::kernel_guids::REGISTRY, EVENT_TRACE_FLAG_REGISTRY);
        /// TCP/IP send/receive/connect events.
        network_tcpip => (crate::dispatch::kernel_guids::TCPIP, EVENT_TRACE_FLAG_NETWORK_TCPIP);
        /// File create/read/write/delete events.
        file_io => (crate::dispatch::kernel_guids::FILE_IO, EVENT_TRACE_FLAG_FILE_IO | EVENT_TRACE_FLAG_FILE_IO_INIT);
        /// Hard and soft page-fault events.
        page_fault => (crate::dispatch::kernel_guids::PAGE_FAULT, EVENT_TRACE_FLAG_MEMORY_PAGE_FAULTS | EVENT_TRACE_FLAG_MEMORY_HARD_FAULTS);
        /// Sampled-profile and system-call events.
        perf_info => (crate::dispatch::kernel_guids::PERF_INFO, EVENT_TRACE_FLAG_PROFILE);
    }

    pub fn id(&self) -> Guid {
        self.id
    }

    /// The session enable-flag bits this producer contributes.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Attaches a callback invoked for every delivered event of this
    /// producer.
    #[must_use]
    pub fn add_callback(mut self, callback: impl Fn(&EventRecord<'_>) + Send + Sync + 'static) -> Self {
        self.callbacks.push(CallbackSlot {
            ids: None,
            callback: Box::new(callback),
        });
        self
    }

    /// Attaches a callback invoked only for the listed opcodes.
    #[must_use]
    pub fn add_filtered_callback(
        mut self,
        opcodes: impl IntoIterator<Item = u16>,
        callback: impl Fn(&EventRecord<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.push(CallbackSlot {
            ids: Some(opcodes.into_iter().collect()),
            callback: Box::new(callback),
        });
        self
    }
}

impl fmt::Debug for KernelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelProvider")
            .field("id", &self.id)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SynthRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn merge_unions_flags_and_overwrites_level() {
        let first = EnableInfo {
            level: 4,
            any: 0x10,
            all: 0,
            properties: EnableProperty::SID,
            rundown: false,
        };
        let second = EnableInfo {
            level: 2,
            any: 0x08,
            all: 0x4,
            properties: EnableProperty::STACK_TRACE,
            rundown: true,
        };
        let merged = EnableInfo::merge(first, second);
        assert_eq!(merged.level, 2);
        assert_eq!(merged.any, 0x18);
        assert_eq!(merged.all, 0x4);
        assert_eq!(merged.properties, EnableProperty::SID | EnableProperty::STACK_TRACE);
        assert!(merged.rundown);
    }

    #[test]
    fn merge_never_clears_rundown() {
        let on = EnableInfo {
            rundown: true,
            ..EnableInfo::default()
        };
        let off = EnableInfo::default();
        assert!(EnableInfo::merge(on, off).rundown);
        assert!(EnableInfo::merge(off, on).rundown);
    }

    #[test]
    fn absorb_accumulates_callbacks_and_filters() {
        let id = Guid::random();
        let mut registration = Registration::from_provider(
            Provider::new(id).level(4).any(0x10).add_callback(|_| {}),
        );
        registration.absorb(
            Provider::new(id)
                .level(2)
                .any(0x08)
                .rundown()
                .add_callback(|_| {}),
        );
        assert_eq!(registration.info.level, 2);
        assert_eq!(registration.info.any, 0x18);
        assert!(registration.info.rundown);
        assert_eq!(registration.callbacks.len(), 2);
    }

    #[test]
    fn filtered_callbacks_see_only_their_ids() {
        let id = Guid::random();
        let all = Arc::new(AtomicUsize::new(0));
        let only_seven = Arc::new(AtomicUsize::new(0));
        let all_clone = Arc::clone(&all);
        let seven_clone = Arc::clone(&only_seven);
        let registration = Registration::from_provider(
            Provider::new(id)
                .add_callback(move |_| {
                    all_clone.fetch_add(1, Ordering::Relaxed);
                })
                .add_filtered_callback([7u16], move |_| {
                    seven_clone.fetch_add(1, Ordering::Relaxed);
                }),
        );

        for event_id in [3u16, 7, 9] {
            let raw = SynthRecord::new(id).event_id(event_id).build();
            // SAFETY: the synthesized record owns no out-of-line payload.
            let record = unsafe { crate::record::EventRecord::from_raw(&raw) };
            registration.dispatch(&record);
        }
        assert_eq!(all.load(Ordering::Relaxed), 3);
        assert_eq!(only_seven.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn kernel_provider_flags_are_disjoint_per_producer() {
        let providers = [
            KernelProvider::process(),
            KernelProvider::thread(),
            KernelProvider::image_load(),
            KernelProvider::disk_io(),
            KernelProvider::registry(),
            KernelProvider::network_tcpip(),
            KernelProvider::file_io(),
            KernelProvider::page_fault(),
            KernelProvider::perf_info(),
        ];
        let mut seen = 0u32;
        for provider in &providers {
            assert_ne!(provider.flags(), 0);
            assert_eq!(seen & provider.flags(), 0);
            seen |= provider.flags();
        }
        let ids: std::collections::BTreeSet<_> =
            providers.iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids.len(), providers.len());
    }
}
