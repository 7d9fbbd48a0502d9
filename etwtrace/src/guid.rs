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

use etwtrace_sys::GUID;
use std::fmt;

/// 128-bit identity of a provider or trace session, laid out like the native
/// `GUID` struct so it can be handed to the subsystem without conversion.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid(GUID);

impl Guid {
    /// The all-zero GUID.
    pub const fn zero() -> Self {
        Self(GUID {
            Data1: 0,
            Data2: 0,
            Data3: 0,
            Data4: [0; 8],
        })
    }

    /// Creates a GUID from the conventional four-field form.
    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self(GUID {
            Data1: data1,
            Data2: data2,
            Data3: data3,
            Data4: data4,
        })
    }

    /// Creates a GUID from a u128 in RFC byte order, matching the
    /// `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` reading of the value.
    pub const fn from_u128(value: u128) -> Self {
        let b = value.to_be_bytes();
        Self(GUID {
            Data1: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            Data2: u16::from_be_bytes([b[4], b[5]]),
            Data3: u16::from_be_bytes([b[6], b[7]]),
            Data4: [b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]],
        })
    }

    /// Generates a fresh random (version 4) GUID. Used for unnamed session
    /// identities and the per-session trace GUID.
    pub fn random() -> Self {
        Self::from_u128(uuid::Uuid::new_v4().as_u128())
    }

    /// Parses a GUID from a string with optional braces and optional dashes.
    /// Returns `None` when the input is not a valid GUID spelling.
    pub fn try_parse(value: &str) -> Option<Self> {
        let trimmed = value
            .strip_prefix('{')
            .and_then(|v| v.strip_suffix('}'))
            .unwrap_or(value);
        let mut nibbles = 0u32;
        let mut acc = 0u128;
        for ch in trimmed.chars() {
            if ch == '-' {
                continue;
            }
            let digit = ch.to_digit(16)?;
            if nibbles == 32 {
                return None;
            }
            acc = (acc << 4) | digit as u128;
            nibbles += 1;
        }
        (nibbles == 32).then(|| Self::from_u128(acc))
    }

    pub(crate) const fn as_abi(&self) -> &GUID {
        &self.0
    }

    pub(crate) const fn from_abi(raw: GUID) -> Self {
        Self(raw)
    }
}

impl From<GUID> for Guid {
    fn from(raw: GUID) -> Self {
        Self(raw)
    }
}

impl From<Guid> for GUID {
    fn from(guid: Guid) -> Self {
        guid.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            g.Data1,
            g.Data2,
            g.Data3,
            g.Data4[0],
            g.Data4[1],
            g.Data4[2],
            g.Data4[3],
            g.Data4[4],
            g.Data4[5],
            g.Data4[6],
            g.Data4[7],
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{self}}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POWERSHELL: u128 = 0xa0c1853b_5c40_4b15_8766_3cf1c58f985a;

    #[test]
    fn parse_accepts_braced_dashed_and_bare() {
        let expected = Guid::from_u128(POWERSHELL);
        for spelling in [
            "{A0C1853B-5C40-4B15-8766-3CF1C58F985A}",
            "a0c1853b-5c40-4b15-8766-3cf1c58f985a",
            "a0c1853b5c404b1587663cf1c58f985a",
        ] {
            assert_eq!(Guid::try_parse(spelling), Some(expected));
        }
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(Guid::try_parse(""), None);
        assert_eq!(Guid::try_parse("{a0c1853b-5c40}"), None);
        assert_eq!(Guid::try_parse("a0c1853b5c404b1587663cf1c58f985a00"), None);
        assert_eq!(Guid::try_parse("g0c1853b-5c40-4b15-8766-3cf1c58f985a"), None);
    }

    #[test]
    fn display_round_trips() {
        let guid = Guid::from_u128(POWERSHELL);
        assert_eq!(guid.to_string(), "a0c1853b-5c40-4b15-8766-3cf1c58f985a");
        assert_eq!(Guid::try_parse(&guid.to_string()), Some(guid));
    }

    #[test]
    fn fields_match_abi_layout() {
        let guid = Guid::from_fields(0xa0c1853b, 0x5c40, 0x4b15, [0x87, 0x66, 0x3c, 0xf1, 0xc5, 0x8f, 0x98, 0x5a]);
        assert_eq!(guid, Guid::from_u128(POWERSHELL));
        assert_eq!(guid.as_abi().Data1, 0xa0c1853b);
    }

    #[test]
    fn random_guids_are_distinct() {
        assert_ne!(Guid::random(), Guid::random());
        assert_ne!(Guid::random(), Guid::zero());
    }
}
