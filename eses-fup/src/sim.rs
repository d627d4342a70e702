// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! A simulated peer enclosure and a [`TunnelTransport`] that talks to it.
//!
//! The peer speaks the same pages as real hardware: control pages are encoded
//! and decoded through `eses-messages`, and every answer comes back as an
//! encoded tunnel command status page. Faults can be injected per command.

use crate::attributes::AttributeId;
use crate::attributes::AttributeStore;
use crate::attributes::AttributeValue;
use crate::attributes::FwRevision;
use crate::attributes::InMemoryAttributeStore;
use crate::error::TransportError;
use crate::fup_info::FupTarget;
use crate::transport::Completion;
use crate::transport::EnclosureStatus;
use crate::transport::TunnelOpcode;
use crate::transport::TunnelRequest;
use crate::transport::TunnelTransport;
use eses_messages::encode_config_page;
use eses_messages::encode_download_control_page;
use eses_messages::encode_tunnel_status_page;
use eses_messages::DownloadControlHeader;
use eses_messages::DownloadMode;
use eses_messages::DownloadStatus;
use eses_messages::DownloadStatusPage;
use eses_messages::TunnelDiagStatus;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Fixed-format sense data for ILLEGAL REQUEST / INVALID FIELD IN PARAMETER
/// LIST, returned when a control page carries a stale generation code.
const INVALID_FIELD_SENSE: [u8; 18] =
    [0x70, 0, 0x05, 0, 0, 0, 0, 10, 0, 0, 0, 0, 0x26, 0, 0, 0, 0, 0];

/// A misbehaviour to apply to a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The local expander reports busy; the command is not executed.
    Busy,
    /// The command fails outright and is not executed.
    Failed,
    /// Never complete the command.
    Hang,
    /// Answer a tunnel command status request with the previous result, if
    /// there is one.
    StalePage,
    /// Answer a tunnel command status request with a tunnel failure.
    TunneledCmdFailed,
}

pub type FaultSource = Box<dyn FnMut(TunnelOpcode) -> Option<Fault> + Send>;

#[derive(Debug)]
enum PeerState {
    Idle,
    Receiving { target: FupTarget, image_length: u32, data: Vec<u8> },
    Loaded { target: FupTarget, data: Vec<u8> },
    Activating { target: FupTarget, polls_left: u32 },
    Failed(DownloadStatus),
}

impl PeerState {
    fn download_status(&self) -> DownloadStatus {
        match self {
            PeerState::Idle => DownloadStatus::None,
            PeerState::Receiving { .. } => DownloadStatus::InProgress,
            PeerState::Loaded { .. } => DownloadStatus::NeedsActivate,
            PeerState::Activating { .. } => DownloadStatus::ActivateInProgress,
            PeerState::Failed(status) => *status,
        }
    }
}

/// Result of the last tunneled command, handed out by the next tunnel
/// command status request.
#[derive(Debug, Default)]
struct PendingResult {
    data: Vec<u8>,
    response: Vec<u8>,
    polls_left: u32,
}

/// The peer side of an enclosure as seen through the tunnel.
pub struct SimulatedPeer {
    log: Logger,
    attributes: Arc<InMemoryAttributeStore>,
    new_revision: FwRevision,
    generation_code: u32,
    state: PeerState,
    pending: Option<PendingResult>,
    last_data: Vec<u8>,
    last_image: Option<Vec<u8>>,
    processing_polls: u32,
    activation_polls: u32,
    faults: VecDeque<Fault>,
    fault_source: Option<FaultSource>,
    power_cycles: usize,
}

impl SimulatedPeer {
    /// A peer whose activated images report `new_revision` in `attributes`.
    pub fn new(
        log: &Logger,
        attributes: Arc<InMemoryAttributeStore>,
        new_revision: FwRevision,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "simulated-peer")),
            attributes,
            new_revision,
            generation_code: 1,
            state: PeerState::Idle,
            pending: None,
            last_data: Vec::new(),
            last_image: None,
            processing_polls: 1,
            activation_polls: 2,
            faults: VecDeque::new(),
            fault_source: None,
            power_cycles: 0,
        }
    }

    /// Number of status requests answered with "processing" before a
    /// tunneled command's result is available.
    pub fn with_processing_polls(mut self, polls: u32) -> Self {
        self.processing_polls = polls;
        self
    }

    /// Number of download status reads an activation stays in progress.
    pub fn with_activation_polls(mut self, polls: u32) -> Self {
        self.activation_polls = polls;
        self
    }

    pub fn with_fault_source(mut self, source: FaultSource) -> Self {
        self.fault_source = Some(source);
        self
    }

    /// Apply `fault` to the next command, ahead of any fault source.
    pub fn inject(&mut self, fault: Fault) {
        self.faults.push_back(fault);
    }

    /// The most recent fully received image.
    pub fn image(&self) -> Option<&[u8]> {
        self.last_image.as_deref()
    }

    pub fn download_status(&self) -> DownloadStatus {
        self.state.download_status()
    }

    pub fn generation_code(&self) -> u32 {
        self.generation_code
    }

    pub fn power_cycles(&self) -> usize {
        self.power_cycles
    }

    fn next_fault(&mut self, opcode: TunnelOpcode) -> Option<Fault> {
        if let Some(fault) = self.faults.pop_front() {
            return Some(fault);
        }
        self.fault_source.as_mut().and_then(|source| source(opcode))
    }

    /// Execute one command, returning the completion the local expander
    /// would report for it, or `None` if it never completes.
    pub fn handle(
        &mut self,
        target: FupTarget,
        request: TunnelRequest<'_>,
    ) -> Result<Option<Completion>, TransportError> {
        let opcode = request.opcode();
        let fault = self.next_fault(opcode);
        if let Some(fault) = fault {
            debug!(
                self.log, "injecting fault";
                "fault" => ?fault,
                "opcode" => ?opcode,
            );
        }
        match fault {
            Some(Fault::Busy) => {
                return Ok(Some(Completion::Status(EnclosureStatus::Busy)));
            }
            Some(Fault::Failed) => {
                return Ok(Some(Completion::Status(EnclosureStatus::CmdFailed)));
            }
            Some(Fault::Hang) => return Ok(None),
            Some(Fault::StalePage | Fault::TunneledCmdFailed) | None => (),
        }

        let result = match request {
            TunnelRequest::GetConfiguration => {
                let mut page = vec![0; 8];
                let n = encode_config_page(&mut page, self.generation_code)
                    .map_err(|err| TransportError::Encode {
                        page: "configuration",
                        err,
                    })?;
                page.truncate(n);
                PendingResult { data: page, ..Default::default() }
            }
            TunnelRequest::DownloadFirmware(control) => {
                let mut page = vec![0; 24 + control.chunk.len()];
                let n = encode_download_control_page(
                    &mut page,
                    target.side,
                    control.generation_code,
                    control.mode,
                    control.buffer_offset,
                    control.image_length,
                    control.chunk,
                )
                .map_err(|err| TransportError::Encode {
                    page: "download microcode control",
                    err,
                })?;
                self.receive_control_page(target, &page[..n])
            }
            TunnelRequest::GetDownloadStatus => {
                self.poll_activation();
                let page = DownloadStatusPage::new(
                    self.generation_code,
                    target.side,
                    self.state.download_status(),
                    0,
                );
                let mut buf = vec![0; mem::size_of::<DownloadStatusPage>()];
                let n = page.encode(&mut buf).map_err(|err| {
                    TransportError::Encode { page: "download status", err }
                })?;
                buf.truncate(n);
                PendingResult { data: buf, ..Default::default() }
            }
            TunnelRequest::GetTunnelCommandStatus => {
                let page = self.tunnel_status(fault)?;
                return Ok(Some(Completion::TunnelStatusPage(page)));
            }
        };

        self.pending =
            Some(PendingResult { polls_left: self.processing_polls, ..result });
        Ok(Some(Completion::Status(EnclosureStatus::Ok)))
    }

    fn receive_control_page(
        &mut self,
        target: FupTarget,
        page: &[u8],
    ) -> PendingResult {
        let rejected = PendingResult {
            response: INVALID_FIELD_SENSE.to_vec(),
            ..Default::default()
        };

        let (header, chunk) = match DownloadControlHeader::decode(page) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(self.log, "bad control page"; "err" => %err);
                return rejected;
            }
        };
        if header.generation_code.get() != self.generation_code {
            warn!(
                self.log, "control page with stale generation code";
                "got" => header.generation_code.get(),
                "expected" => self.generation_code,
            );
            return rejected;
        }

        match DownloadMode::try_from(header.mode) {
            Ok(DownloadMode::Download) => self.ingest_chunk(
                target,
                header.buffer_offset.get(),
                header.image_length.get(),
                chunk,
            ),
            Ok(DownloadMode::Activate) => self.activate(target),
            Err(mode) => {
                warn!(self.log, "unsupported download mode"; "mode" => mode);
                return rejected;
            }
        }
        PendingResult::default()
    }

    fn ingest_chunk(
        &mut self,
        target: FupTarget,
        offset: u32,
        image_length: u32,
        chunk: &[u8],
    ) {
        self.state = match mem::replace(&mut self.state, PeerState::Idle) {
            _ if offset == 0 => PeerState::Receiving {
                target,
                image_length,
                data: Vec::with_capacity(image_length as usize),
            },
            // A resent final chunk reopens the image.
            PeerState::Loaded { data, .. } => PeerState::Receiving {
                target,
                image_length: data.len() as u32,
                data,
            },
            other => other,
        };
        let PeerState::Receiving { data, image_length: expected, .. } =
            &mut self.state
        else {
            self.state = PeerState::Failed(DownloadStatus::ErrorPageField);
            return;
        };

        // A resent chunk replaces whatever followed its offset.
        let offset = offset as usize;
        if offset > data.len() || image_length != *expected {
            self.state = PeerState::Failed(DownloadStatus::ErrorPageField);
            return;
        }
        data.truncate(offset);
        data.extend_from_slice(chunk);

        if data.len() == *expected as usize {
            let data = mem::take(data);
            info!(self.log, "image received"; "bytes" => data.len());
            self.last_image = Some(data.clone());
            self.state = PeerState::Loaded { target, data };
        } else if data.len() > *expected as usize {
            self.state = PeerState::Failed(DownloadStatus::ErrorImage);
        }
    }

    fn activate(&mut self, target: FupTarget) {
        match &self.state {
            PeerState::Loaded { target: loaded, .. } if *loaded == target => {
                info!(self.log, "activating image"; "target" => %target);
                self.state = PeerState::Activating {
                    target,
                    polls_left: self.activation_polls,
                };
            }
            PeerState::Activating { .. } => (),
            _ => self.state = PeerState::Failed(DownloadStatus::NoImage),
        }
    }

    fn poll_activation(&mut self) {
        if let PeerState::Activating { polls_left, .. } = &mut self.state {
            if *polls_left > 0 {
                *polls_left -= 1;
                return;
            }
            self.finish_activation();
        }
    }

    fn finish_activation(&mut self) {
        let PeerState::Activating { target, .. } = self.state else {
            return;
        };
        self.state = PeerState::Idle;

        let component = target.kind.component_type();
        let result = self
            .attributes
            .index_for_side(component, target.side)
            .and_then(|index| {
                self.attributes.set(
                    AttributeId::FwRevision,
                    component,
                    index,
                    AttributeValue::Revision(self.new_revision),
                )
            });
        match result {
            Ok(()) => info!(
                self.log, "image activated";
                "target" => %target,
                "revision" => %self.new_revision,
            ),
            Err(err) => warn!(
                self.log, "cannot record activated revision";
                "target" => %target,
                "err" => %InlineErrorChain::new(&err),
            ),
        }
    }

    fn tunnel_status(
        &mut self,
        fault: Option<Fault>,
    ) -> Result<Vec<u8>, TransportError> {
        let (status, data, response) = match fault {
            Some(Fault::TunneledCmdFailed) => {
                self.pending = None;
                (TunnelDiagStatus::FailComm, Vec::new(), Vec::new())
            }
            Some(Fault::StalePage) if !self.last_data.is_empty() => {
                (TunnelDiagStatus::Success, self.last_data.clone(), Vec::new())
            }
            _ => match self.pending.take() {
                Some(mut pending) if pending.polls_left > 0 => {
                    pending.polls_left -= 1;
                    self.pending = Some(pending);
                    (TunnelDiagStatus::ProcessingPeer, Vec::new(), Vec::new())
                }
                Some(PendingResult { data, response, .. }) => {
                    if !data.is_empty() {
                        self.last_data = data.clone();
                    }
                    (TunnelDiagStatus::Success, data, response)
                }
                // Nothing outstanding; the expander repeats its last answer.
                None => (
                    TunnelDiagStatus::Success,
                    self.last_data.clone(),
                    Vec::new(),
                ),
            },
        };

        let mut page = vec![0; 9 + data.len() + response.len()];
        let n = encode_tunnel_status_page(&mut page, status, &data, &response)
            .map_err(|err| TransportError::Encode {
                page: "tunnel command status",
                err,
            })?;
        page.truncate(n);
        Ok(page)
    }

    /// Power cycle the peer LCC. Any activation in progress completes and the
    /// configuration generation moves on.
    pub fn power_cycle(&mut self) {
        self.power_cycles += 1;
        self.pending = None;
        self.faults.clear();
        self.finish_activation();
        if matches!(self.state, PeerState::Receiving { .. }) {
            self.state = PeerState::Idle;
        }
        self.generation_code = self.generation_code.wrapping_add(1);
        info!(
            self.log, "peer power cycled";
            "power_cycles" => self.power_cycles,
        );
    }
}

/// [`TunnelTransport`] over a [`SimulatedPeer`]. Completions are delivered on
/// the channel returned by [`SimTransport::new`].
#[derive(Clone)]
pub struct SimTransport {
    peer: Arc<Mutex<SimulatedPeer>>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl SimTransport {
    pub fn new(
        peer: Arc<Mutex<SimulatedPeer>>,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, rx) = mpsc::unbounded_channel();
        (Self { peer, completions }, rx)
    }
}

impl TunnelTransport for SimTransport {
    fn send(
        &mut self,
        target: FupTarget,
        request: TunnelRequest<'_>,
    ) -> Result<(), TransportError> {
        let completion = self
            .peer
            .lock()
            .map_err(|_| TransportError::NotConnected)?
            .handle(target, request)?;
        if let Some(completion) = completion {
            self.completions
                .send(completion)
                .map_err(|_| TransportError::NotConnected)?;
        }
        Ok(())
    }

    fn power_cycle_lcc(&mut self, _index: usize) -> Result<(), TransportError> {
        self.peer
            .lock()
            .map_err(|_| TransportError::NotConnected)?
            .power_cycle();
        Ok(())
    }
}
