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

use crate::{error::TraceError, guid::Guid, subsystem::TraceSubsystem};
use etwtrace_sys::*;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Payload comparison operators understood by the subsystem's payload
/// filter engine.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    /// Numeric or string equality.
    Equal = PAYLOADFIELD_EQ,
    /// Numeric or string inequality.
    NotEqual = PAYLOADFIELD_NE,
    /// Numeric less-than-or-equal.
    LessOrEqual = PAYLOADFIELD_LE,
    /// Numeric greater-than.
    Greater = PAYLOADFIELD_GT,
    /// Numeric less-than.
    Less = PAYLOADFIELD_LT,
    /// Numeric greater-than-or-equal.
    GreaterOrEqual = PAYLOADFIELD_GE,
    /// String containment, case-insensitive.
    Contains = PAYLOADFIELD_CONTAINS,
    /// Negated string containment, case-insensitive.
    DoesNotContain = PAYLOADFIELD_DOESNTCONTAIN,
    /// String identity, case-insensitive.
    Is = PAYLOADFIELD_IS,
    /// Negated string identity, case-insensitive.
    IsNot = PAYLOADFIELD_ISNOT,
}

/// One field comparison evaluated by the subsystem before delivery.
/// Resolving the field metadata requires a provider manifest; the manifest
/// source is a configuration input, see [`EventFilter::Payload`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadPredicate {
    /// Field name as declared in the provider manifest.
    pub field: String,
    /// Comparison operator.
    pub op: CompareOp,
    /// Right-hand side, spelled the way the manifest declares the field.
    pub value: String,
}

impl PayloadPredicate {
    /// Convenience constructor.
    pub fn new(field: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

/// A provider-side filter predicate, translated into one native descriptor
/// per distinct variant at enable time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventFilter {
    /// Opaque system-flags blob forwarded verbatim.
    SystemFlags {
        /// Flag value handed to the subsystem.
        flags: u64,
        /// Size in bytes the subsystem should read from the value.
        size: u32,
    },
    /// Allow- or deny-list of event ids.
    EventIds {
        /// The 16-bit event ids.
        ids: BTreeSet<u16>,
        /// `true` delivers only the listed ids, `false` suppresses them.
        filter_in: bool,
    },
    /// Allow-list of process ids. Capped at
    /// [`MAX_EVENT_FILTER_PID_COUNT`] entries by the subsystem.
    ProcessIds {
        /// The process ids to deliver events for.
        pids: BTreeSet<u32>,
    },
    /// Allow- or deny-list of event names (TraceLogging providers only).
    /// Carries the merged level/keyword fields in its packed header.
    EventNames {
        /// NUL-free UTF-8 event names.
        names: BTreeSet<String>,
        /// `true` delivers only the listed names, `false` suppresses them.
        filter_in: bool,
    },
    /// A payload predicate evaluated against decoded fields. Requires the
    /// provider manifest; `manifest` points at a binary to load it from, or
    /// `None` if the provider is expected to be registered system-wide.
    Payload {
        /// The comparison to evaluate.
        predicate: PayloadPredicate,
        /// Optional manifest binary to resolve field metadata from.
        manifest: Option<PathBuf>,
    },
}

impl EventFilter {
    /// The native type tag this filter assembles into. At most one
    /// descriptor per tag may be submitted per enable call.
    pub fn type_tag(&self) -> u32 {
        match self {
            EventFilter::SystemFlags { .. } => EVENT_FILTER_TYPE_SYSTEM_FLAGS,
            EventFilter::EventIds { .. } => EVENT_FILTER_TYPE_EVENT_ID,
            EventFilter::ProcessIds { .. } => EVENT_FILTER_TYPE_PID,
            EventFilter::EventNames { .. } => EVENT_FILTER_TYPE_EVENT_NAME,
            EventFilter::Payload { .. } => EVENT_FILTER_TYPE_PAYLOAD,
        }
    }
}

/// A payload filter aggregated by the subsystem, together with whatever
/// allocation backs `descriptor.Ptr`.
pub struct AssembledPayloadFilter {
    pub(crate) descriptor: EVENT_FILTER_DESCRIPTOR,
    pub(crate) storage: PayloadStorage,
}

pub(crate) enum PayloadStorage {
    /// The descriptor points into this buffer.
    Owned(#[allow(dead_code)] Vec<u8>),
    /// The descriptor owns a TDH aggregate that must be cleaned up natively.
    #[cfg(windows)]
    Tdh,
}

impl Drop for AssembledPayloadFilter {
    fn drop(&mut self) {
        #[cfg(windows)]
        if matches!(self.storage, PayloadStorage::Tdh) {
            // SAFETY: the descriptor was produced by TdhAggregatePayloadFilters
            // and has not been cleaned up before.
            unsafe {
                TdhCleanupPayloadEventFilterDescriptor(&mut self.descriptor);
            }
        }
    }
}

/// Keyword/level passthrough fields required by the packed event-name
/// filter header.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FilterContext {
    pub level: u8,
    pub any: u64,
    pub all: u64,
}

/// The assembled, fixed-capacity native descriptor array for one enable
/// call, owning every packed backing buffer its entries point into.
///
/// The backing storage must outlive the native call that consumes the
/// descriptor pointers: enable-time assemblies are dropped as soon as the
/// call returns, pre-session assemblies are stored in the session and live
/// until it unregisters.
#[derive(Default)]
pub(crate) struct FilterDescriptors {
    descriptors: Vec<EVENT_FILTER_DESCRIPTOR>,
    // Pointed into by `descriptors`; the Vec heap blocks stay put when the
    // struct itself moves.
    buffers: Vec<Vec<u8>>,
    payload: Vec<AssembledPayloadFilter>,
}

impl FilterDescriptors {
    /// Translates `filters` into the flat native descriptor array.
    /// Duplicate type tags overwrite the earlier slot (last wins); the
    /// subsystem accepts only one descriptor per tag.
    pub fn assemble(
        filters: &[EventFilter],
        ctx: FilterContext,
        source_id: &Guid,
        subsystem: &dyn TraceSubsystem,
    ) -> Result<Self, TraceError> {
        let mut out = Self::default();
        for filter in filters {
            let entry = match filter {
                EventFilter::SystemFlags { flags, size } => {
                    Some(out.pack(filter.type_tag(), *size, flags.to_ne_bytes().to_vec()))
                }
                EventFilter::EventIds { ids, filter_in } => {
                    Self::pack_event_ids(ids, *filter_in)
                        .map(|buf| out.pack(filter.type_tag(), buf.len() as u32, buf))
                }
                EventFilter::ProcessIds { pids } => {
                    Self::pack_pids(pids)?
                        .map(|buf| out.pack(filter.type_tag(), buf.len() as u32, buf))
                }
                EventFilter::EventNames { names, filter_in } => {
                    Self::pack_event_names(names, *filter_in, ctx)
                        .map(|buf| out.pack(filter.type_tag(), buf.len() as u32, buf))
                }
                EventFilter::Payload { predicate, manifest } => {
                    let aggregated = subsystem.aggregate_payload_filter(
                        source_id,
                        predicate,
                        manifest.as_deref(),
                    )?;
                    let descriptor = aggregated.descriptor;
                    out.payload.push(aggregated);
                    Some(descriptor)
                }
            };
            if let Some(descriptor) = entry {
                out.insert(descriptor)?;
            }
        }
        Ok(out)
    }

    pub fn as_slice(&self) -> &[EVENT_FILTER_DESCRIPTOR] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    // Stores `buf` and returns a descriptor addressing it. `size` may be
    // smaller than the buffer for fixed-value filters.
    fn pack(&mut self, type_tag: u32, size: u32, buf: Vec<u8>) -> EVENT_FILTER_DESCRIPTOR {
        let descriptor = EVENT_FILTER_DESCRIPTOR {
            Ptr: buf.as_ptr() as u64,
            Size: size,
            Type: type_tag,
        };
        self.buffers.push(buf);
        descriptor
    }

    fn insert(&mut self, descriptor: EVENT_FILTER_DESCRIPTOR) -> Result<(), TraceError> {
        if let Some(slot) = self.descriptors.iter_mut().find(|d| d.Type == descriptor.Type) {
            *slot = descriptor;
            return Ok(());
        }
        if self.descriptors.len() == MAX_EVENT_FILTERS_COUNT {
            return Err(TraceError::TooManyFilters(self.descriptors.len() + 1));
        }
        self.descriptors.push(descriptor);
        Ok(())
    }

    // EVENT_FILTER_EVENT_ID: {FilterIn, Reserved, Count} header followed by
    // a packed tail of `Count` u16 ids.
    fn pack_event_ids(ids: &BTreeSet<u16>, filter_in: bool) -> Option<Vec<u8>> {
        if ids.is_empty() {
            return None;
        }
        let mut buf = Vec::with_capacity(4 + 2 * ids.len());
        buf.push(filter_in as u8);
        buf.push(0); // Reserved
        buf.extend_from_slice(&(ids.len() as u16).to_ne_bytes());
        for id in ids {
            buf.extend_from_slice(&id.to_ne_bytes());
        }
        Some(buf)
    }

    // EVENT_FILTER_TYPE_PID carries a bare array of u32 process ids.
    fn pack_pids(pids: &BTreeSet<u32>) -> Result<Option<Vec<u8>>, TraceError> {
        if pids.is_empty() {
            return Ok(None);
        }
        if pids.len() > MAX_EVENT_FILTER_PID_COUNT {
            return Err(TraceError::InvalidParameter);
        }
        let mut buf = Vec::with_capacity(4 * pids.len());
        for pid in pids {
            buf.extend_from_slice(&pid.to_ne_bytes());
        }
        Ok(Some(buf))
    }

    // EVENT_FILTER_EVENT_NAME: {MatchAnyKeyword, MatchAllKeyword, Level,
    // FilterIn, NameCount} header followed by NameCount NUL-terminated
    // UTF-8 names.
    fn pack_event_names(
        names: &BTreeSet<String>,
        filter_in: bool,
        ctx: FilterContext,
    ) -> Option<Vec<u8>> {
        if names.is_empty() {
            return None;
        }
        let tail: usize = names.iter().map(|n| n.len() + 1).sum();
        let mut buf = Vec::with_capacity(20 + tail);
        buf.extend_from_slice(&ctx.any.to_ne_bytes());
        buf.extend_from_slice(&ctx.all.to_ne_bytes());
        buf.push(ctx.level);
        buf.push(filter_in as u8);
        buf.extend_from_slice(&(names.len() as u16).to_ne_bytes());
        for name in names {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        Some(buf)
    }
}
