// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The tunnel command status page (83h).
//!
//! After a command has been tunneled to the peer, the local expander reports
//! its progress through this page. Its fixed 9-byte header is followed by
//! `data_length` bytes of data returned by the tunneled command (itself a
//! complete SES page) and then `response_length` bytes of SCSI response.

use crate::put;
use crate::DecodeError;
use crate::EncodeError;
use crate::PageCode;
use crate::ScsiStatus;
use core::mem;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::byteorder::big_endian::U16;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

/// Responses at or below this length were produced by expander firmware that
/// omits the SCSI status byte; the entire response is sense data and the
/// command is assumed to have ended in CHECK CONDITION.
pub const BARE_SENSE_RESPONSE_MAX_LEN: usize = 18;

/// Status of the tunneled command, byte 4 of the status page.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum TunnelDiagStatus {
    Success,
    ProcessingLocal,
    ProcessingPeer,
    Aborted,
    FailResources,
    FailComm,
    FailCollision,
    FailRequestInvalid,
    FailBusy,
    Unknown(u8),
}

impl TunnelDiagStatus {
    /// True if the local or peer expander is still working on the command.
    pub fn is_processing(self) -> bool {
        matches!(self, Self::ProcessingLocal | Self::ProcessingPeer)
    }
}

impl From<u8> for TunnelDiagStatus {
    fn from(value: u8) -> Self {
        match value {
            0x0 => Self::Success,
            0x1 => Self::ProcessingLocal,
            0x2 => Self::ProcessingPeer,
            0x3 => Self::Aborted,
            0x4 => Self::FailResources,
            0x5 => Self::FailComm,
            0x6 => Self::FailCollision,
            0x7 => Self::FailRequestInvalid,
            0x8 => Self::FailBusy,
            other => Self::Unknown(other),
        }
    }
}

impl From<TunnelDiagStatus> for u8 {
    fn from(status: TunnelDiagStatus) -> Self {
        match status {
            TunnelDiagStatus::Success => 0x0,
            TunnelDiagStatus::ProcessingLocal => 0x1,
            TunnelDiagStatus::ProcessingPeer => 0x2,
            TunnelDiagStatus::Aborted => 0x3,
            TunnelDiagStatus::FailResources => 0x4,
            TunnelDiagStatus::FailComm => 0x5,
            TunnelDiagStatus::FailCollision => 0x6,
            TunnelDiagStatus::FailRequestInvalid => 0x7,
            TunnelDiagStatus::FailBusy => 0x8,
            TunnelDiagStatus::Unknown(other) => other,
        }
    }
}

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
pub struct TunnelStatusHeader {
    pub page_code: PageCode,
    /// Protocol in bits 0-1, request type in bits 2-4.
    pub protocol_request: u8,
    pub page_length: U16,
    pub status: u8,
    pub data_length: U16,
    pub response_length: U16,
}

static_assertions::const_assert_eq!(mem::size_of::<TunnelStatusHeader>(), 9);

/// A decoded tunnel command status page, borrowing from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStatusPage<'a> {
    pub header: TunnelStatusHeader,
    /// The page returned by the tunneled command, if any.
    pub data: &'a [u8],
    /// The SCSI response of the tunneled command, if any.
    pub response: &'a [u8],
}

/// The SCSI outcome of a tunneled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiResponse<'a> {
    pub status: ScsiStatus,
    pub sense: &'a [u8],
}

impl<'a> TunnelStatusPage<'a> {
    /// Decode a tunnel command status page from the front of `buf`.
    pub fn decode(buf: &'a [u8]) -> Result<Self, DecodeError> {
        let (header, rest) = TunnelStatusHeader::read_from_prefix(buf)
            .map_err(|_| DecodeError::BufferTooSmall)?;
        if header.page_code != PageCode::TUNNEL_DIAGNOSTIC {
            return Err(DecodeError::WrongPageCode {
                expected: PageCode::TUNNEL_DIAGNOSTIC,
                got: header.page_code,
            });
        }

        let data_len = usize::from(header.data_length.get());
        let response_len = usize::from(header.response_length.get());
        if data_len + response_len > rest.len() {
            return Err(DecodeError::LengthTooLong);
        }
        let (data, rest) = rest.split_at(data_len);
        let response = &rest[..response_len];

        Ok(Self { header, data, response })
    }

    pub fn status(&self) -> TunnelDiagStatus {
        TunnelDiagStatus::from(self.header.status)
    }

    /// The SCSI status and sense data of the tunneled command, or `None` if
    /// no response was returned.
    pub fn scsi_response(&self) -> Option<ScsiResponse<'a>> {
        let response = self.response;
        if response.is_empty() {
            None
        } else if response.len() <= BARE_SENSE_RESPONSE_MAX_LEN {
            Some(ScsiResponse {
                status: ScsiStatus::CHECK_CONDITION,
                sense: response,
            })
        } else {
            Some(ScsiResponse {
                status: ScsiStatus(response[0]),
                sense: &response[1..],
            })
        }
    }
}

/// Encode a tunnel command status page into `out`, returning the number of
/// bytes written.
pub fn encode_tunnel_status_page(
    out: &mut [u8],
    status: TunnelDiagStatus,
    data: &[u8],
    response: &[u8],
) -> Result<usize, EncodeError> {
    let data_length =
        u16::try_from(data.len()).map_err(|_| EncodeError::LengthTooLong)?;
    let response_length = u16::try_from(response.len())
        .map_err(|_| EncodeError::LengthTooLong)?;
    let total = mem::size_of::<TunnelStatusHeader>() + data.len() + response.len();
    let page_length =
        u16::try_from(total - 4).map_err(|_| EncodeError::LengthTooLong)?;
    if out.len() < total {
        return Err(EncodeError::BufferTooSmall);
    }

    let header = TunnelStatusHeader {
        page_code: PageCode::TUNNEL_DIAGNOSTIC,
        protocol_request: 0,
        page_length: page_length.into(),
        status: status.into(),
        data_length: data_length.into(),
        response_length: response_length.into(),
    };
    let rest = put(out, &header)?;
    let (data_out, rest) = rest.split_at_mut(data.len());
    data_out.copy_from_slice(data);
    rest[..response.len()].copy_from_slice(response);

    Ok(total)
}
