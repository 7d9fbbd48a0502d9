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

//! Per-kind session policy and event routing.
//!
//! User-mode and kernel-mode sessions differ in naming rules, session
//! identity, how providers are switched on and how an incoming event finds
//! its callbacks. [`TraceKind`] captures those differences so the session
//! state machine stays kind-agnostic.

use crate::error::{check_status, TraceError};
use crate::filter::{FilterContext, FilterDescriptors};
use crate::guid::Guid;
use crate::provider::{KernelProvider, Provider, Registration};
use crate::record::EventRecord;
use crate::subsystem::{TraceInfo, TraceSubsystem};
use etwtrace_sys::*;
use std::collections::HashMap;

/// The identity of the OS-owned system logger session.
pub const SYSTEM_TRACE_CONTROL: Guid = Guid::from_fields(
    0x9e81_4aad,
    0x3204,
    0x11d2,
    [0x9a, 0x82, 0x00, 0x60, 0x08, 0xa8, 0x69, 0x39],
);

/// Identities the kernel stamps on the events of its fixed producers.
pub mod kernel_guids {
    use crate::guid::Guid;

    pub const PROCESS: Guid = Guid::from_fields(
        0x3d6f_a8d0,
        0xfe05,
        0x11d0,
        [0x9d, 0xda, 0x00, 0xc0, 0x4f, 0xd7, 0xba, 0x7c],
    );
    pub const THREAD: Guid = Guid::from_fields(
        0x3d6f_a8d1,
        0xfe05,
        0x11d0,
        [0x9d, 0xda, 0x00, 0xc0, 0x4f, 0xd7, 0xba, 0x7c],
    );
    pub const IMAGE_LOAD: Guid = Guid::from_fields(
        0x2cb1_5d1d,
        0x5fc1,
        0x11d2,
        [0xab, 0xe1, 0x00, 0xa0, 0xc9, 0x11, 0xf5, 0x18],
    );
    pub const DISK_IO: Guid = Guid::from_fields(
        0x3d6f_a8d4,
        0xfe05,
        0x11d0,
        [0x9d, 0xda, 0x00, 0xc0, 0x4f, 0xd7, 0xba, 0x7c],
    );
    pub const REGISTRY: Guid = Guid::from_fields(
        0xae53_722e,
        0xc863,
        0x11d2,
        [0x86, 0x59, 0x00, 0xc0, 0x4f, 0xa3, 0x21, 0xa1],
    );
    pub const TCPIP: Guid = Guid::from_fields(
        0x9a28_0ac0,
        0xc8e0,
        0x11d1,
        [0x84, 0xe2, 0x00, 0xc0, 0x4f, 0xb9, 0x98, 0xa2],
    );
    pub const FILE_IO: Guid = Guid::from_fields(
        0x90cb_dc39,
        0x4a3e,
        0x11d1,
        [0x84, 0xf4, 0x00, 0x00, 0xf8, 0x04, 0x64, 0xe3],
    );
    pub const PAGE_FAULT: Guid = Guid::from_fields(
        0x3d6f_a8d3,
        0xfe05,
        0x11d0,
        [0x9d, 0xda, 0x00, 0xc0, 0x4f, 0xd7, 0xba, 0x7c],
    );
    pub const PERF_INFO: Guid = Guid::from_fields(
        0xce1d_bfb4,
        0x137e,
        0x4da6,
        [0x87, 0xb0, 0x3f, 0x59, 0xaa, 0x10, 0x2c, 0xbc],
    );
}

// Kernel events carry the producer identity, not a per-provider
// registration, so routing goes identity -> enable-flag bits -> attached
// producers claiming those bits.
const KERNEL_ROUTES: &[(Guid, u32)] = &[
    (kernel_guids::PROCESS, EVENT_TRACE_FLAG_PROCESS),
    (kernel_guids::THREAD, EVENT_TRACE_FLAG_THREAD),
    (kernel_guids::IMAGE_LOAD, EVENT_TRACE_FLAG_IMAGE_LOAD),
    (kernel_guids::DISK_IO, EVENT_TRACE_FLAG_DISK_IO),
    (kernel_guids::REGISTRY, EVENT_TRACE_FLAG_REGISTRY),
    (kernel_guids::TCPIP, EVENT_TRACE_FLAG_NETWORK_TCPIP),
    (
        kernel_guids::FILE_IO,
        EVENT_TRACE_FLAG_FILE_IO | EVENT_TRACE_FLAG_FILE_IO_INIT,
    ),
    (
        kernel_guids::PAGE_FAULT,
        EVENT_TRACE_FLAG_MEMORY_PAGE_FAULTS | EVENT_TRACE_FLAG_MEMORY_HARD_FAULTS,
    ),
    (kernel_guids::PERF_INFO, EVENT_TRACE_FLAG_PROFILE),
];

fn kernel_route(id: &Guid) -> u32 {
    KERNEL_ROUTES
        .iter()
        .find(|(guid, _)| guid == id)
        .map(|(_, flags)| *flags)
        .unwrap_or(0)
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::UserMode {}
    impl Sealed for super::KernelMode {}
}

/// Compile-time strategy distinguishing user-mode from kernel-mode
/// sessions.
pub trait TraceKind: sealed::Sealed + Send + Sync + 'static {
    /// The provider description this kind accepts.
    type Provider: Send + 'static;
    /// The merged per-session provider store.
    type Registry: Default + Send + Sync + 'static;

    /// Resolves the session name the subsystem will see.
    fn effective_name(requested: &str) -> String;

    /// The identity stamped into the session's registration block.
    fn session_guid() -> Guid;

    /// Kind-specific adjustments to the registration block, applied just
    /// before the session is registered.
    fn augment(info: &mut TraceInfo, registry: &Self::Registry);

    /// Folds a provider into the registry, merging with an existing entry
    /// of the same identity. Returns the identity.
    fn attach(registry: &mut Self::Registry, provider: Self::Provider) -> Guid;

    /// Whether an identity is currently attached.
    fn contains(registry: &Self::Registry, id: &Guid) -> bool;

    /// Removes an identity. Returns whether it was present.
    fn detach(registry: &mut Self::Registry, id: &Guid) -> bool;

    /// Pushes one identity's merged enablement to a live session.
    fn enable_one(
        registry: &mut Self::Registry,
        id: &Guid,
        session: TRACEHANDLE,
        info: &mut TraceInfo,
        name: &[u16],
        subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError>;

    /// Pushes every merged enablement during registration.
    fn enable_all(
        registry: &mut Self::Registry,
        session: TRACEHANDLE,
        info: &mut TraceInfo,
        name: &[u16],
        subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError>;

    /// Issues a native disable for one already-detached identity. Statuses
    /// are returned raw so the caller can treat "already gone" as benign.
    fn disable_one(
        registry: &Self::Registry,
        id: &Guid,
        session: TRACEHANDLE,
        info: &mut TraceInfo,
        name: &[u16],
        subsystem: &dyn TraceSubsystem,
    ) -> u32;

    /// Requests capture-state rundowns for providers that asked for them.
    /// Runs immediately before processing starts.
    fn request_rundowns(
        registry: &Self::Registry,
        session: TRACEHANDLE,
        subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError>;

    /// Routes one delivered event to its callbacks. Returns whether any
    /// provider claimed it.
    fn forward(
        registry: &Self::Registry,
        record: &EventRecord<'_>,
        subsystem: &dyn TraceSubsystem,
    ) -> bool;
}

/// Session over user-registered manifest or TraceLogging providers.
pub struct UserMode;

/// Session over the fixed kernel producers.
pub struct KernelMode;

impl UserMode {
    fn enable(
        registration: &mut Registration,
        session: TRACEHANDLE,
        subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError> {
        let ctx = FilterContext {
            level: registration.info.level,
            any: registration.info.any,
            all: registration.info.all,
        };
        let assembled = FilterDescriptors::assemble(
            &registration.filters,
            ctx,
            &registration.id,
            subsystem,
        )?;

        let mut parameters = ENABLE_TRACE_PARAMETERS {
            EnableProperty: registration.info.properties.bits(),
            SourceId: *registration.id.as_abi(),
            ..ENABLE_TRACE_PARAMETERS::default()
        };
        if !assembled.is_empty() {
            parameters.EnableFilterDesc = assembled.as_slice().as_ptr();
            parameters.FilterDescCount = assembled.as_slice().len() as u32;
        }
        let status = subsystem.enable_trace(
            session,
            &registration.id,
            EVENT_CONTROL_CODE_ENABLE_PROVIDER,
            registration.info.level,
            registration.info.any,
            registration.info.all,
            &parameters,
        );
        check_status(status)?;
        // The subsystem keeps reading pre-session filter buffers, so the
        // backing storage moves into the registration.
        registration.assembled = Some(assembled);
        Ok(())
    }
}

impl TraceKind for UserMode {
    type Provider = Provider;
    type Registry = HashMap<Guid, Registration>;

    fn effective_name(requested: &str) -> String {
        if requested.is_empty() {
            Guid::random().to_string()
        } else {
            requested.to_string()
        }
    }

    fn session_guid() -> Guid {
        Guid::random()
    }

    fn augment(info: &mut TraceInfo, _registry: &Self::Registry) {
        info.properties.LogFileMode |= EVENT_TRACE_INDEPENDENT_SESSION_MODE;
    }

    fn attach(registry: &mut Self::Registry, provider: Self::Provider) -> Guid {
        let id = provider.id();
        match registry.entry(id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().absorb(provider);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Registration::from_provider(provider));
            }
        }
        id
    }

    fn contains(registry: &Self::Registry, id: &Guid) -> bool {
        registry.contains_key(id)
    }

    fn detach(registry: &mut Self::Registry, id: &Guid) -> bool {
        registry.remove(id).is_some()
    }

    fn enable_one(
        registry: &mut Self::Registry,
        id: &Guid,
        session: TRACEHANDLE,
        _info: &mut TraceInfo,
        _name: &[u16],
        subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError> {
        match registry.get_mut(id) {
            Some(registration) => Self::enable(registration, session, subsystem),
            None => Ok(()),
        }
    }

    fn enable_all(
        registry: &mut Self::Registry,
        session: TRACEHANDLE,
        _info: &mut TraceInfo,
        _name: &[u16],
        subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError> {
        for registration in registry.values_mut() {
            Self::enable(registration, session, subsystem)?;
        }
        Ok(())
    }

    fn disable_one(
        _registry: &Self::Registry,
        id: &Guid,
        session: TRACEHANDLE,
        _info: &mut TraceInfo,
        _name: &[u16],
        subsystem: &dyn TraceSubsystem,
    ) -> u32 {
        let parameters = ENABLE_TRACE_PARAMETERS::default();
        subsystem.enable_trace(
            session,
            id,
            EVENT_CONTROL_CODE_DISABLE_PROVIDER,
            0,
            0,
            0,
            &parameters,
        )
    }

    fn request_rundowns(
        registry: &Self::Registry,
        session: TRACEHANDLE,
        subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError> {
        for registration in registry.values().filter(|r| r.info.rundown) {
            let parameters = ENABLE_TRACE_PARAMETERS::default();
            let status = subsystem.enable_trace(
                session,
                &registration.id,
                EVENT_CONTROL_CODE_CAPTURE_STATE,
                registration.info.level,
                registration.info.any,
                registration.info.all,
                &parameters,
            );
            check_status(status)?;
        }
        Ok(())
    }

    fn forward(
        registry: &Self::Registry,
        record: &EventRecord<'_>,
        subsystem: &dyn TraceSubsystem,
    ) -> bool {
        // Fast path: the header identity names the provider directly.
        if let Some(registration) = registry.get(&record.provider_id()) {
            registration.dispatch(record);
            return true;
        }
        // Legacy events publish under a message identity; the true provider
        // comes out of the metadata database.
        if record.is_classic() {
            if let Some(resolved) = subsystem.resolve_provider(record.as_abi()) {
                if let Some(registration) = registry.get(&resolved) {
                    registration.dispatch(record);
                    return true;
                }
            }
        }
        false
    }
}

impl TraceKind for KernelMode {
    type Provider = KernelProvider;
    type Registry = Vec<KernelProvider>;

    fn effective_name(_requested: &str) -> String {
        // The OS accepts exactly one kernel logger session, under this name.
        KERNEL_LOGGER_NAME.to_string()
    }

    fn session_guid() -> Guid {
        SYSTEM_TRACE_CONTROL
    }

    fn augment(info: &mut TraceInfo, registry: &Self::Registry) {
        info.properties.EnableFlags = registry.iter().map(|p| p.flags).fold(0, |a, f| a | f);
    }

    fn attach(registry: &mut Self::Registry, provider: Self::Provider) -> Guid {
        let id = provider.id();
        match registry.iter_mut().find(|p| p.id == id) {
            Some(existing) => {
                existing.flags |= provider.flags;
                existing.callbacks.extend(provider.callbacks);
            }
            None => registry.push(provider),
        }
        id
    }

    fn contains(registry: &Self::Registry, id: &Guid) -> bool {
        registry.iter().any(|p| p.id == *id)
    }

    fn detach(registry: &mut Self::Registry, id: &Guid) -> bool {
        let before = registry.len();
        registry.retain(|p| p.id != *id);
        registry.len() != before
    }

    fn enable_one(
        registry: &mut Self::Registry,
        _id: &Guid,
        session: TRACEHANDLE,
        info: &mut TraceInfo,
        name: &[u16],
        subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError> {
        // Kernel producers are switched by session enable flags, so a live
        // attach is an update of the whole flag set.
        Self::augment(info, registry);
        check_status(subsystem.control_trace(session, name, info, EVENT_TRACE_CONTROL_UPDATE))
    }

    fn enable_all(
        _registry: &mut Self::Registry,
        _session: TRACEHANDLE,
        _info: &mut TraceInfo,
        _name: &[u16],
        _subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError> {
        // Enable flags ride along in the registration block itself.
        Ok(())
    }

    fn disable_one(
        registry: &Self::Registry,
        _id: &Guid,
        session: TRACEHANDLE,
        info: &mut TraceInfo,
        name: &[u16],
        subsystem: &dyn TraceSubsystem,
    ) -> u32 {
        // There is no per-producer disable call; the shrunken flag union is
        // pushed with a session update instead.
        Self::augment(info, registry);
        subsystem.control_trace(session, name, info, EVENT_TRACE_CONTROL_UPDATE)
    }

    fn request_rundowns(
        _registry: &Self::Registry,
        _session: TRACEHANDLE,
        _subsystem: &dyn TraceSubsystem,
    ) -> Result<(), TraceError> {
        // The kernel session emits its rundowns on start unconditionally.
        Ok(())
    }

    fn forward(
        registry: &Self::Registry,
        record: &EventRecord<'_>,
        _subsystem: &dyn TraceSubsystem,
    ) -> bool {
        let flags = kernel_route(&record.provider_id());
        if flags == 0 {
            return false;
        }
        let mut handled = false;
        for provider in registry.iter().filter(|p| p.flags & flags != 0) {
            for slot in &provider.callbacks {
                if slot.matches(record.opcode() as u16) {
                    (slot.callback)(record);
                    handled = true;
                }
            }
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSubsystem, SynthRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn user_forward_matches_header_identity_only() {
        let g1 = Guid::random();
        let g2 = Guid::random();
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));

        let mut registry = <UserMode as TraceKind>::Registry::default();
        let a = Arc::clone(&hits_a);
        UserMode::attach(
            &mut registry,
            Provider::new(g1).add_callback(move |_| {
                a.fetch_add(1, Ordering::Relaxed);
            }),
        );
        let b = Arc::clone(&hits_b);
        UserMode::attach(
            &mut registry,
            Provider::new(g2).add_callback(move |_| {
                b.fetch_add(1, Ordering::Relaxed);
            }),
        );

        let subsystem = FakeSubsystem::new();
        let raw = SynthRecord::new(g2).build();
        // SAFETY: the synthesized record owns no out-of-line payload.
        let record = unsafe { EventRecord::from_raw(&raw) };
        assert!(UserMode::forward(&registry, &record, &subsystem));
        assert_eq!(hits_a.load(Ordering::Relaxed), 0);
        assert_eq!(hits_b.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn user_forward_resolves_classic_identity_through_metadata() {
        let true_id = Guid::random();
        let message_id = Guid::random();
        let hits = Arc::new(AtomicUsize::new(0));

        let mut registry = <UserMode as TraceKind>::Registry::default();
        let counter = Arc::clone(&hits);
        UserMode::attach(
            &mut registry,
            Provider::new(true_id).add_callback(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );

        let subsystem = FakeSubsystem::new();
        subsystem.map_classic_provider(message_id, true_id);

        let raw = SynthRecord::new(message_id).classic().build();
        // SAFETY: the synthesized record owns no out-of-line payload.
        let record = unsafe { EventRecord::from_raw(&raw) };
        assert!(UserMode::forward(&registry, &record, &subsystem));
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        // Without the classic marker the slow path never runs.
        let raw = SynthRecord::new(message_id).build();
        // SAFETY: as above.
        let record = unsafe { EventRecord::from_raw(&raw) };
        assert!(!UserMode::forward(&registry, &record, &subsystem));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn user_name_policy_generates_identity_for_empty_names() {
        assert_eq!(UserMode::effective_name("My Session"), "My Session");
        let generated = UserMode::effective_name("");
        assert!(Guid::try_parse(&generated).is_some());
    }

    #[test]
    fn kernel_name_is_fixed() {
        assert_eq!(KernelMode::effective_name("ignored"), KERNEL_LOGGER_NAME);
        assert_eq!(KernelMode::session_guid(), SYSTEM_TRACE_CONTROL);
    }

    #[test]
    fn kernel_augment_unions_enable_flags() {
        let mut registry = vec![KernelProvider::process(), KernelProvider::image_load()];
        KernelMode::attach(&mut registry, KernelProvider::thread());
        let mut info = TraceInfo::default();
        KernelMode::augment(&mut info, &registry);
        assert_eq!(
            info.properties.EnableFlags,
            EVENT_TRACE_FLAG_PROCESS | EVENT_TRACE_FLAG_IMAGE_LOAD | EVENT_TRACE_FLAG_THREAD
        );
    }

    #[test]
    fn kernel_forward_routes_by_producer_identity() {
        let process_hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&process_hits);
        let registry = vec![
            KernelProvider::process().add_callback(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
            KernelProvider::thread(),
        ];
        let subsystem = FakeSubsystem::new();

        let raw = SynthRecord::new(kernel_guids::PROCESS).build();
        // SAFETY: the synthesized record owns no out-of-line payload.
        let record = unsafe { EventRecord::from_raw(&raw) };
        assert!(KernelMode::forward(&registry, &record, &subsystem));
        assert_eq!(process_hits.load(Ordering::Relaxed), 1);

        // A producer nobody attached (disk io) goes unclaimed.
        let raw = SynthRecord::new(kernel_guids::DISK_IO).build();
        // SAFETY: as above.
        let record = unsafe { EventRecord::from_raw(&raw) };
        assert!(!KernelMode::forward(&registry, &record, &subsystem));
    }

    #[test]
    fn enable_sends_merged_flags_and_filters() {
        let id = Guid::random();
        let mut registry = <UserMode as TraceKind>::Registry::default();
        UserMode::attach(&mut registry, Provider::new(id).level(4).any(0x10));
        UserMode::attach(
            &mut registry,
            Provider::new(id).level(2).any(0x08).add_filter(crate::filter::EventFilter::EventIds {
                ids: [7u16].into_iter().collect(),
                filter_in: true,
            }),
        );

        let subsystem = FakeSubsystem::new();
        let mut info = TraceInfo::default();
        UserMode::enable_all(&mut registry, 11, &mut info, &[0], &subsystem).unwrap();

        let enables = subsystem.enables();
        assert_eq!(enables.len(), 1);
        assert_eq!(enables[0].provider, id);
        assert_eq!(enables[0].level, 2);
        assert_eq!(enables[0].any, 0x18);
        assert_eq!(enables[0].filter_types, vec![EVENT_FILTER_TYPE_EVENT_ID]);
        // Backing buffers moved into the registration for the session's
        // lifetime.
        assert!(registry.get(&id).unwrap().assembled.is_some());
    }
}
