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

use crate::guid::Guid;
use etwtrace_sys::*;

/// Zero-copy view over one raw ABI event record, valid only for the duration
/// of the callback it is handed to. Typed property parsing lives in the
/// schema layer; this view exposes the header fields and the raw payload.
pub struct EventRecord<'a> {
    raw: &'a EVENT_RECORD,
}

impl<'a> EventRecord<'a> {
    /// Wraps a raw record delivered by the subsystem.
    ///
    /// # Safety
    ///
    /// `raw` must point to a live, fully-initialized EVENT_RECORD whose
    /// UserData region (if non-null) spans `UserDataLength` readable bytes.
    /// The returned view must not outlive the delivery callback.
    pub unsafe fn from_raw(raw: &'a EVENT_RECORD) -> Self {
        Self { raw }
    }

    /// The producer identity embedded in the event header. For classic
    /// events this may be a message GUID rather than the true provider id.
    pub fn provider_id(&self) -> Guid {
        Guid::from_abi(self.raw.EventHeader.ProviderId)
    }

    pub fn event_id(&self) -> u16 {
        self.raw.EventHeader.EventDescriptor.Id
    }

    pub fn version(&self) -> u8 {
        self.raw.EventHeader.EventDescriptor.Version
    }

    pub fn opcode(&self) -> u8 {
        self.raw.EventHeader.EventDescriptor.Opcode
    }

    pub fn level(&self) -> u8 {
        self.raw.EventHeader.EventDescriptor.Level
    }

    pub fn keyword(&self) -> u64 {
        self.raw.EventHeader.EventDescriptor.Keyword
    }

    pub fn process_id(&self) -> u32 {
        self.raw.EventHeader.ProcessId
    }

    pub fn thread_id(&self) -> u32 {
        self.raw.EventHeader.ThreadId
    }

    /// Raw event timestamp, in the clock resolution the session was
    /// registered with (QPC ticks by default).
    pub fn timestamp(&self) -> i64 {
        self.raw.EventHeader.TimeStamp
    }

    /// Whether the event was published through the legacy provider ABI,
    /// meaning the header identity needs a metadata lookup to resolve.
    pub fn is_classic(&self) -> bool {
        self.raw.EventHeader.Flags & EVENT_HEADER_FLAG_CLASSIC_HEADER != 0
    }

    /// The undecoded payload bytes.
    pub fn user_data(&self) -> &'a [u8] {
        if self.raw.UserData.is_null() || self.raw.UserDataLength == 0 {
            return &[];
        }
        // SAFETY: from_raw's contract guarantees UserDataLength readable
        // bytes behind UserData for the lifetime of the view.
        unsafe {
            std::slice::from_raw_parts(
                self.raw.UserData as *const u8,
                self.raw.UserDataLength as usize,
            )
        }
    }

    /// The underlying ABI record, for collaborators that need to hand it
    /// back to the subsystem's metadata resolver.
    pub fn as_abi(&self) -> &EVENT_RECORD {
        self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SynthRecord;

    #[test]
    fn header_accessors_read_through() {
        let guid = Guid::from_u128(0x11111111_2222_3333_4444_555566667777);
        let raw = SynthRecord::new(guid)
            .event_id(42)
            .version(3)
            .opcode(2)
            .level(4)
            .keyword(0x8000_0000_0000_0010)
            .process_id(1234)
            .thread_id(5678)
            .timestamp(99)
            .build();
        // SAFETY: the synthesized record owns no out-of-line payload.
        let record = unsafe { EventRecord::from_raw(&raw) };
        assert_eq!(record.provider_id(), guid);
        assert_eq!(record.event_id(), 42);
        assert_eq!(record.version(), 3);
        assert_eq!(record.opcode(), 2);
        assert_eq!(record.level(), 4);
        assert_eq!(record.keyword(), 0x8000_0000_0000_0010);
        assert_eq!(record.process_id(), 1234);
        assert_eq!(record.thread_id(), 5678);
        assert_eq!(record.timestamp(), 99);
        assert!(!record.is_classic());
    }

    #[test]
    fn classic_marker_reflects_header_flags() {
        let raw = SynthRecord::new(Guid::zero()).classic().build();
        // SAFETY: the synthesized record owns no out-of-line payload.
        let record = unsafe { EventRecord::from_raw(&raw) };
        assert!(record.is_classic());
    }

    #[test]
    fn null_user_data_reads_as_empty() {
        let raw = SynthRecord::new(Guid::zero()).build();
        // SAFETY: the synthesized record owns no out-of-line payload.
        let record = unsafe { EventRecord::from_raw(&raw) };
        assert!(record.user_data().is_empty());
    }
}
