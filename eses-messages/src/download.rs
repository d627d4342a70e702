// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Download microcode control/status pages (0Eh) and the generation code
//! carried by the configuration page (01h).

use crate::put;
use crate::DecodeError;
use crate::EncodeError;
use crate::PageCode;
use crate::PageHeader;
use core::mem;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::byteorder::big_endian::U16;
use zerocopy::byteorder::big_endian::U32;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

/// Largest image chunk a single tunneled download control page can carry.
pub const MAX_TUNNEL_CHUNK_SIZE: u32 = 2000 & 0x0ff8;

/// Status reported in a download microcode status descriptor.
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
pub enum DownloadStatus {
    /// No download in progress.
    None,
    InProgress,
    /// Transfer complete, updating flash.
    UpdatingFlash,
    UpdatingNonvolatile,
    /// Complete; the subenclosure will attempt to use the image.
    ImageInUse,
    /// Complete; needs activation or a hard reset.
    NeedsActivate,
    ActivateInProgress,
    ErrorPageField,
    ErrorChecksum,
    ErrorTimeout,
    ErrorImage,
    ErrorBackup,
    /// Activation requested with no deferred image loaded.
    NoImage,
    ActivateFailed,
    Unknown(u8),
}

impl DownloadStatus {
    /// True for codes reporting a failed download or activation.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            Self::None
                | Self::InProgress
                | Self::UpdatingFlash
                | Self::UpdatingNonvolatile
                | Self::ImageInUse
                | Self::NeedsActivate
                | Self::ActivateInProgress
        )
    }
}

impl From<u8> for DownloadStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::None,
            0x01 => Self::InProgress,
            0x02 => Self::UpdatingFlash,
            0x03 => Self::UpdatingNonvolatile,
            0x10 => Self::ImageInUse,
            0x13 => Self::NeedsActivate,
            0x70 => Self::ActivateInProgress,
            0x80 => Self::ErrorPageField,
            0x81 => Self::ErrorChecksum,
            0x82 => Self::ErrorTimeout,
            0x83 => Self::ErrorImage,
            0x84 => Self::ErrorBackup,
            0x85 => Self::NoImage,
            0xf0 => Self::ActivateFailed,
            other => Self::Unknown(other),
        }
    }
}

impl From<DownloadStatus> for u8 {
    fn from(status: DownloadStatus) -> Self {
        match status {
            DownloadStatus::None => 0x00,
            DownloadStatus::InProgress => 0x01,
            DownloadStatus::UpdatingFlash => 0x02,
            DownloadStatus::UpdatingNonvolatile => 0x03,
            DownloadStatus::ImageInUse => 0x10,
            DownloadStatus::NeedsActivate => 0x13,
            DownloadStatus::ActivateInProgress => 0x70,
            DownloadStatus::ErrorPageField => 0x80,
            DownloadStatus::ErrorChecksum => 0x81,
            DownloadStatus::ErrorTimeout => 0x82,
            DownloadStatus::ErrorImage => 0x83,
            DownloadStatus::ErrorBackup => 0x84,
            DownloadStatus::NoImage => 0x85,
            DownloadStatus::ActivateFailed => 0xf0,
            DownloadStatus::Unknown(other) => other,
        }
    }
}

/// Mode byte of the download microcode control page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadMode {
    /// Download and defer activation.
    Download,
    /// Activate a previously deferred image.
    Activate,
}

impl From<DownloadMode> for u8 {
    fn from(mode: DownloadMode) -> Self {
        match mode {
            DownloadMode::Download => 0x0e,
            DownloadMode::Activate => 0x0f,
        }
    }
}

impl TryFrom<u8> for DownloadMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0e => Ok(Self::Download),
            0x0f => Ok(Self::Activate),
            other => Err(other),
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
pub struct DownloadStatusDescriptor {
    pub reserved: u8,
    pub subenclosure_id: u8,
    pub status: u8,
    pub additional_status: u8,
    pub max_size: U32,
    pub reserved1: [u8; 3],
    pub expected_buffer_id: u8,
    pub expected_buffer_offset: U32,
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
pub struct DownloadStatusPage {
    pub header: PageHeader,
    pub generation_code: U32,
    pub descriptor: DownloadStatusDescriptor,
}

static_assertions::const_assert_eq!(mem::size_of::<DownloadStatusPage>(), 24);

impl DownloadStatusPage {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let (page, _) = Self::read_from_prefix(buf)
            .map_err(|_| DecodeError::BufferTooSmall)?;
        if page.header.page_code != PageCode::DOWNLOAD_MICROCODE {
            return Err(DecodeError::WrongPageCode {
                expected: PageCode::DOWNLOAD_MICROCODE,
                got: page.header.page_code,
            });
        }
        Ok(page)
    }

    pub fn new(
        generation_code: u32,
        subenclosure_id: u8,
        status: DownloadStatus,
        additional_status: u8,
    ) -> Self {
        let page_length = (mem::size_of::<Self>() - 4) as u16;
        Self {
            header: PageHeader {
                page_code: PageCode::DOWNLOAD_MICROCODE,
                byte1: 1,
                page_length: page_length.into(),
            },
            generation_code: generation_code.into(),
            descriptor: DownloadStatusDescriptor {
                reserved: 0,
                subenclosure_id,
                status: status.into(),
                additional_status,
                max_size: U32::ZERO,
                reserved1: [0; 3],
                expected_buffer_id: 0,
                expected_buffer_offset: U32::ZERO,
            },
        }
    }

    pub fn status(&self) -> DownloadStatus {
        DownloadStatus::from(self.descriptor.status)
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        put(out, self)?;
        Ok(mem::size_of::<Self>())
    }
}

/// Generation code carried at bytes 4-7 of the configuration page.
///
/// Every control page sent to the enclosure must echo the generation code
/// of the most recent configuration, or it is rejected.
pub fn decode_generation_code(config_page: &[u8]) -> Result<u32, DecodeError> {
    let (header, rest) = PageHeader::read_from_prefix(config_page)
        .map_err(|_| DecodeError::BufferTooSmall)?;
    if header.page_code != PageCode::CONFIGURATION {
        return Err(DecodeError::WrongPageCode {
            expected: PageCode::CONFIGURATION,
            got: header.page_code,
        });
    }
    let (generation_code, _) = U32::read_from_prefix(rest)
        .map_err(|_| DecodeError::BufferTooSmall)?;
    Ok(generation_code.get())
}

/// Encode the fixed front of a configuration page (no subenclosure or type
/// descriptors).
pub fn encode_config_page(
    out: &mut [u8],
    generation_code: u32,
) -> Result<usize, EncodeError> {
    let header = PageHeader {
        page_code: PageCode::CONFIGURATION,
        byte1: 0,
        page_length: U16::new(4),
    };
    let rest = put(out, &header)?;
    put(rest, &U32::new(generation_code))?;
    Ok(8)
}

/// Header of a download microcode control page; the image chunk (if any)
/// follows it directly.
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
pub struct DownloadControlHeader {
    pub page_code: PageCode,
    pub subenclosure_id: u8,
    pub page_length: U16,
    pub generation_code: U32,
    pub mode: u8,
    pub reserved: [u8; 2],
    pub buffer_id: u8,
    pub buffer_offset: U32,
    pub image_length: U32,
    pub transfer_length: U32,
}

static_assertions::const_assert_eq!(
    mem::size_of::<DownloadControlHeader>(),
    24
);

impl DownloadControlHeader {
    /// Decode a control page, returning the header and the image chunk that
    /// follows it.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let (header, rest) = Self::read_from_prefix(buf)
            .map_err(|_| DecodeError::BufferTooSmall)?;
        if header.page_code != PageCode::DOWNLOAD_MICROCODE {
            return Err(DecodeError::WrongPageCode {
                expected: PageCode::DOWNLOAD_MICROCODE,
                got: header.page_code,
            });
        }
        let transfer_length = header.transfer_length.get() as usize;
        if transfer_length > rest.len() {
            return Err(DecodeError::LengthTooLong);
        }
        Ok((header, &rest[..transfer_length]))
    }
}

/// Encode a download microcode control page carrying `chunk` into `out`,
/// returning the number of bytes written.
pub fn encode_download_control_page(
    out: &mut [u8],
    subenclosure_id: u8,
    generation_code: u32,
    mode: DownloadMode,
    buffer_offset: u32,
    image_length: u32,
    chunk: &[u8],
) -> Result<usize, EncodeError> {
    let transfer_length =
        u32::try_from(chunk.len()).map_err(|_| EncodeError::LengthTooLong)?;
    let total = mem::size_of::<DownloadControlHeader>() + chunk.len();
    let page_length =
        u16::try_from(total - 4).map_err(|_| EncodeError::LengthTooLong)?;
    if out.len() < total {
        return Err(EncodeError::BufferTooSmall);
    }

    let header = DownloadControlHeader {
        page_code: PageCode::DOWNLOAD_MICROCODE,
        subenclosure_id,
        page_length: page_length.into(),
        generation_code: generation_code.into(),
        mode: mode.into(),
        reserved: [0; 2],
        buffer_id: 0,
        buffer_offset: buffer_offset.into(),
        image_length: image_length.into(),
        transfer_length: transfer_length.into(),
    };
    let rest = put(out, &header)?;
    rest[..chunk.len()].copy_from_slice(chunk);

    Ok(total)
}
