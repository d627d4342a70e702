// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use crate::error::TransportError;
use crate::fup_info::FupTarget;
use eses_messages::DownloadMode;
use serde::Deserialize;
use serde::Serialize;

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
pub enum TunnelOpcode {
    GetConfiguration,
    DownloadFirmware,
    GetDownloadStatus,
    GetTunnelCommandStatus,
}

/// Contents of a download microcode control page to tunnel to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadControl<'a> {
    pub mode: DownloadMode,
    pub generation_code: u32,
    pub buffer_offset: u32,
    pub image_length: u32,
    /// Empty when activating.
    pub chunk: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRequest<'a> {
    GetConfiguration,
    DownloadFirmware(DownloadControl<'a>),
    GetDownloadStatus,
    GetTunnelCommandStatus,
}

impl TunnelRequest<'_> {
    pub fn opcode(&self) -> TunnelOpcode {
        match self {
            Self::GetConfiguration => TunnelOpcode::GetConfiguration,
            Self::DownloadFirmware(_) => TunnelOpcode::DownloadFirmware,
            Self::GetDownloadStatus => TunnelOpcode::GetDownloadStatus,
            Self::GetTunnelCommandStatus => TunnelOpcode::GetTunnelCommandStatus,
        }
    }
}

/// Issues tunneled commands through the local expander.
///
/// `send` only reports whether the command could be issued. Its outcome is
/// delivered later as a [`Completion`] through whatever channel the
/// implementation is wired to.
pub trait TunnelTransport: Send {
    fn send(
        &mut self,
        target: FupTarget,
        request: TunnelRequest<'_>,
    ) -> Result<(), TransportError>;

    /// Carry out a power cycle previously requested for the LCC at `index`.
    fn power_cycle_lcc(&mut self, index: usize) -> Result<(), TransportError>;
}

impl<T: TunnelTransport + ?Sized> TunnelTransport for Box<T> {
    fn send(
        &mut self,
        target: FupTarget,
        request: TunnelRequest<'_>,
    ) -> Result<(), TransportError> {
        (**self).send(target, request)
    }

    fn power_cycle_lcc(&mut self, index: usize) -> Result<(), TransportError> {
        (**self).power_cycle_lcc(index)
    }
}

/// Enclosure-level result of a completed command.
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
pub enum EnclosureStatus {
    Ok,
    ProcessingTunnelCmd,
    Busy,
    TunneledCmdFailed,
    TunnelDlFailed,
    CmdFailed,
    PageInvalid,
    PacketFailed,
}

/// Completion of a tunneled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The command completed without returning a page.
    Status(EnclosureStatus),
    /// A tunnel command status page (83h) was read back.
    TunnelStatusPage(Vec<u8>),
}
