// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire formats for the ESES diagnostic pages used to tunnel a firmware
//! upgrade through the local expander to its peer.
//!
//! All multi-byte fields on these pages are big-endian. Layouts are expressed
//! as `zerocopy` structs so that a page can be viewed in place without
//! copying; the variable-length parts (tunneled data, SCSI response) are
//! returned as subslices of the caller's buffer.

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

mod download;
mod tunnel;

use core::fmt;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::byteorder::big_endian::U16;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub use download::*;
pub use tunnel::*;

/// Size of a firmware revision string as reported in the configuration page.
///
/// Revisions are compared as raw bytes over this full width; they may contain
/// embedded NULs.
pub const FW_REVISION_SIZE: usize = 16;

/// Diagnostic page code, the first byte of every SES page.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(transparent)]
pub struct PageCode(pub u8);

impl PageCode {
    pub const CONFIGURATION: Self = Self(0x01);
    pub const ENCLOSURE_BUSY: Self = Self(0x09);
    /// Download microcode control (sent) and status (received) share a code.
    pub const DOWNLOAD_MICROCODE: Self = Self(0x0e);
    /// Tunnel diagnostic control (sent) and tunnel command status (received)
    /// share a code.
    pub const TUNNEL_DIAGNOSTIC: Self = Self(0x83);
    pub const INVALID: Self = Self(0xff);

    /// Peek at the page code of an encoded page.
    pub fn of(page: &[u8]) -> Result<Self, DecodeError> {
        page.first().copied().map(Self).ok_or(DecodeError::BufferTooSmall)
    }
}

impl fmt::Debug for PageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageCode({:#04x})", self.0)
    }
}

impl fmt::Display for PageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// The four bytes common to the front of every SES diagnostic page.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(C)]
pub struct PageHeader {
    pub page_code: PageCode,
    /// Page-specific; the subenclosure count on most status pages.
    pub byte1: u8,
    /// Number of bytes following this field (i.e., total size minus 4).
    pub page_length: U16,
}

static_assertions::const_assert_eq!(core::mem::size_of::<PageHeader>(), 4);

impl PageHeader {
    /// Total page size implied by `page_length`.
    pub fn page_size(&self) -> usize {
        usize::from(self.page_length.get()) + 4
    }
}

/// SCSI status byte of a tunneled command's response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ScsiStatus(pub u8);

impl ScsiStatus {
    pub const GOOD: Self = Self(0x00);
    pub const CHECK_CONDITION: Self = Self(0x02);
    pub const BUSY: Self = Self(0x08);
}

impl fmt::Debug for ScsiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::GOOD => f.write_str("Good"),
            Self::CHECK_CONDITION => f.write_str("CheckCondition"),
            Self::BUSY => f.write_str("Busy"),
            Self(other) => write!(f, "ScsiStatus({other:#04x})"),
        }
    }
}

/// Fields of interest from fixed-format SCSI sense data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenseInfo {
    pub response_code: u8,
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseInfo {
    const SENSE_KEY_OFFSET: usize = 2;
    const SENSE_KEY_MASK: u8 = 0x0f;
    const ASC_OFFSET: usize = 12;
    const ASCQ_OFFSET: usize = 13;

    /// Extract the sense key and additional sense code/qualifier. Returns
    /// `None` if `sense` is too short to contain them.
    pub fn from_sense_data(sense: &[u8]) -> Option<Self> {
        if sense.len() <= Self::ASCQ_OFFSET {
            return None;
        }
        Some(Self {
            response_code: sense[0],
            sense_key: sense[Self::SENSE_KEY_OFFSET] & Self::SENSE_KEY_MASK,
            asc: sense[Self::ASC_OFFSET],
            ascq: sense[Self::ASCQ_OFFSET],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer is too small to contain the fixed portion of the page.
    BufferTooSmall,
    /// A length field requires more data than is remaining in the buffer.
    LengthTooLong,
    /// The page code is not the one this decoder handles.
    WrongPageCode { expected: PageCode, got: PageCode },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::BufferTooSmall => write!(f, "buffer too small"),
            DecodeError::LengthTooLong => write!(f, "length too long"),
            DecodeError::WrongPageCode { expected, got } => {
                write!(f, "wrong page code: expected {expected}, got {got}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The output buffer is too small for the page.
    BufferTooSmall,
    /// A variable-length field does not fit in its 16-bit length.
    LengthTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncodeError::BufferTooSmall => "buffer too small",
            EncodeError::LengthTooLong => "length too long",
        };
        write!(f, "{}", s)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodeError {}

/// Copy `value` into the front of `out`, returning the remainder of `out`.
fn put<'a, T: IntoBytes + Immutable>(
    out: &'a mut [u8],
    value: &T,
) -> Result<&'a mut [u8], EncodeError> {
    let bytes = value.as_bytes();
    if out.len() < bytes.len() {
        return Err(EncodeError::BufferTooSmall);
    }
    let (head, rest) = out.split_at_mut(bytes.len());
    head.copy_from_slice(bytes);
    Ok(rest)
}
