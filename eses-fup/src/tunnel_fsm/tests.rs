// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use super::*;
use crate::attributes::AttributeId;
use crate::attributes::AttributeStore;
use crate::attributes::AttributeValue;
use crate::attributes::ComponentType;
use crate::attributes::FwRevision;
use crate::attributes::InMemoryAttributeStore;
use crate::attributes::PowerCycleRequest;
use crate::error::TransportError;
use crate::fup_info::FupAdditionalStatus;
use crate::fup_info::FupStatus;
use crate::fup_info::FupTarget;
use crate::fup_info::FwTargetKind;
use crate::fup_info::ImageTransferProgress;
use crate::scheduler::Condition;
use crate::scheduler::LocalScheduler;
use crate::testing::attribute_fixture;
use crate::testing::test_logger;
use crate::testing::RecordingTransport;
use crate::testing::Sent;
use crate::testing::OLD_REVISION;
use crate::transport::TunnelOpcode;
use eses_messages::DownloadMode;
use std::sync::Arc;
use strum::IntoEnumIterator;

const PEER_LCC: FupTarget =
    FupTarget { kind: FwTargetKind::LccExpander, side: 1 };
const PEER_PS: FupTarget =
    FupTarget { kind: FwTargetKind::PowerSupply, side: 1 };

struct Harness {
    table: FsmTable,
    ctx: TunnelFupContext,
    info: EnclosureFupInfo,
    config: TunnelFupConfig,
    transport: RecordingTransport,
    attributes: Arc<InMemoryAttributeStore>,
    scheduler: LocalScheduler,
    log: Logger,
}

impl Harness {
    fn new(
        operation: FupOperation,
        target: FupTarget,
        image_size: u32,
        config: TunnelFupConfig,
    ) -> Self {
        let (table, state, image) = match operation {
            FupOperation::Download => (
                FsmTable::Download,
                State::Init,
                Some((0..image_size).map(|i| i as u8).collect()),
            ),
            _ => (FsmTable::Activate, State::Ready, None),
        };

        let mut info = EnclosureFupInfo::new();
        info.operation = operation;
        info.target = Some(target);
        info.set_status(FupStatus::InProgress, FupAdditionalStatus::None);
        info.use_tunnelling = true;
        info.progress = ImageTransferProgress::new(image_size);
        info.image = image;
        info.old_revision = FwRevision::from_str_lossy(OLD_REVISION);

        let mut ctx = TunnelFupContext::new(&config);
        ctx.init(state, Event::TunnelDownloadRequested, &config);

        Self {
            table,
            ctx,
            info,
            config,
            transport: RecordingTransport::default(),
            attributes: attribute_fixture(),
            scheduler: LocalScheduler::new(),
            log: test_logger(),
        }
    }

    fn download(image_size: u32, config: TunnelFupConfig) -> Self {
        Self::new(FupOperation::Download, PEER_LCC, image_size, config)
    }

    fn activate(target: FupTarget) -> Self {
        Self::new(FupOperation::Activate, target, 0, TunnelFupConfig::default())
    }

    fn run(&mut self, event: Event) -> ScheduleOp {
        let mut env = FupEnv {
            log: &self.log,
            config: &self.config,
            info: &mut self.info,
            transport: &mut self.transport,
            attributes: &*self.attributes,
            scheduler: &mut self.scheduler,
        };
        run(self.table, &mut self.ctx, &mut env, event)
    }

    fn at(&mut self, state: State) {
        self.ctx.current_state = state;
    }

    fn state(&self) -> State {
        self.ctx.current_state
    }

    fn change_revision(&self, target: FupTarget) {
        let component = target.kind.component_type();
        let index =
            self.attributes.index_for_side(component, target.side).unwrap();
        self.attributes
            .set(
                AttributeId::FwRevision,
                component,
                index,
                AttributeValue::Revision(FwRevision::from_str_lossy("2.00")),
            )
            .unwrap();
    }

    fn peer_reset_requested(&self) -> bool {
        self.attributes.get_power_cycle_request(1)
            == Ok(PowerCycleRequest::Begin)
    }

    /// Push one chunk through the download table, starting from `Ready`.
    fn chunk_cycle(&mut self) -> ScheduleOp {
        assert_eq!(self.state(), State::Ready);
        assert_eq!(self.run(Event::TunnelDownloadRequested), ScheduleOp::Pend);
        assert_eq!(self.state(), State::SendDownloadControlPage);
        assert_eq!(self.run(Event::Succeeded), ScheduleOp::Pend);
        assert_eq!(self.state(), State::GetDownloadControlPageStatus);
        assert_eq!(self.run(Event::Succeeded), ScheduleOp::Pend);
        assert_eq!(self.state(), State::ReceiveDownloadStatusPage);
        assert_eq!(self.run(Event::Succeeded), ScheduleOp::Pend);
        assert_eq!(self.state(), State::GetReceiveDownloadStatusPageStatus);
        self.run(Event::Succeeded)
    }
}

fn small_chunks(max_chunk_size: u32) -> TunnelFupConfig {
    TunnelFupConfig { max_chunk_size, ..Default::default() }
}

#[test]
fn tables_define_every_cell() {
    for table in [FsmTable::Download, FsmTable::Activate] {
        for state in State::iter() {
            for event in Event::iter() {
                let (action, next) = table.entry(state, event);
                match state {
                    State::WaitForReset => {
                        assert_eq!(
                            (action, next),
                            (Action::WaitForReset, State::WaitForReset)
                        );
                    }
                    State::Last => {
                        assert_eq!((action, next), (Action::Invalid, State::Last));
                    }
                    _ => assert_ne!(next, State::Last, "{table:?} {state:?}"),
                }
            }
        }
    }
}

#[test]
fn activate_table_skips_configuration() {
    for event in Event::iter() {
        for state in [State::Init, State::SendGetConfig] {
            assert_eq!(FsmTable::Activate.entry(state, event).0, Action::Invalid);
        }
    }
    assert_eq!(
        FsmTable::Activate.entry(State::Ready, Event::TunnelDownloadRequested),
        (
            Action::Send(Step::DownloadControlPage),
            State::SendDownloadControlPage
        )
    );
    assert_eq!(
        FsmTable::Activate.entry(State::Ready, Event::Succeeded).0,
        Action::Invalid
    );
}

#[test]
fn tables_differ_on_receive_status_success() {
    let cell = (State::GetReceiveDownloadStatusPageStatus, Event::Succeeded);
    assert_eq!(
        FsmTable::Download.entry(cell.0, cell.1),
        (Action::DownloadComplete, State::Ready)
    );
    assert_eq!(
        FsmTable::Activate.entry(cell.0, cell.1),
        (Action::CheckRevision, State::GetDownloadControlPageStatus)
    );
}

#[test]
fn enclosure_status_translation() {
    use crate::transport::EnclosureStatus as S;
    assert_eq!(Event::from(S::Ok), Event::Succeeded);
    assert_eq!(Event::from(S::ProcessingTunnelCmd), Event::Processing);
    assert_eq!(Event::from(S::Busy), Event::Busy);
    assert_eq!(
        Event::from(S::TunneledCmdFailed),
        Event::TunneledCommandFailed
    );
    assert_eq!(Event::from(S::TunnelDlFailed), Event::TunnelDownloadFailed);
    for other in [S::CmdFailed, S::PageInvalid, S::PacketFailed] {
        assert_eq!(Event::from(other), Event::Failed);
    }
}

#[test]
fn download_fetches_configuration_first() {
    let mut h = Harness::download(100, TunnelFupConfig::default());

    assert_eq!(h.run(Event::TunnelDownloadRequested), ScheduleOp::Pend);
    assert_eq!(h.state(), State::SendGetConfig);
    assert_eq!(h.ctx.previous_state(), State::Init);
    assert_eq!(h.ctx.expected_page(), PageCode::CONFIGURATION);

    assert_eq!(h.run(Event::Succeeded), ScheduleOp::Pend);
    assert_eq!(h.state(), State::Ready);

    // Still waiting on the configuration page.
    assert_eq!(h.run(Event::Processing), ScheduleOp::Pend);
    assert_eq!(h.state(), State::Ready);

    assert_eq!(h.run(Event::Succeeded), ScheduleOp::Pend);
    assert_eq!(h.state(), State::SendDownloadControlPage);
    assert_eq!(
        h.transport.sent(),
        vec![
            Sent::Command(PEER_LCC, TunnelOpcode::GetConfiguration),
            Sent::Command(PEER_LCC, TunnelOpcode::GetTunnelCommandStatus),
            Sent::Command(PEER_LCC, TunnelOpcode::GetTunnelCommandStatus),
            Sent::DownloadControl {
                mode: DownloadMode::Download,
                offset: 0,
                len: 100,
            },
        ]
    );
}

#[test]
fn four_chunk_download_completes_on_last_chunk() {
    let mut h = Harness::download(4096, small_chunks(1024));
    h.at(State::Ready);

    for chunk in 1..=3u32 {
        let op = h.chunk_cycle();
        assert_eq!(op, ScheduleOp::Delay(Duration::ZERO));
        assert_ne!(op, ScheduleOp::Done);
        assert_eq!(h.info.progress.bytes_transferred, chunk * 1024);
        assert_eq!(h.state(), State::Ready);
        assert_eq!(h.ctx.new_event(), Event::TunnelDownloadRequested);
    }

    assert_eq!(h.chunk_cycle(), ScheduleOp::Done);
    assert_eq!(h.info.progress.bytes_transferred, 4096);
    // The concluding handler does not move the state.
    assert_eq!(h.state(), State::GetReceiveDownloadStatusPageStatus);

    let offsets: Vec<_> = h
        .transport
        .sent()
        .into_iter()
        .filter_map(|sent| match sent {
            Sent::DownloadControl { offset, len, .. } => Some((offset, len)),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, [(0, 1024), (1024, 1024), (2048, 1024), (3072, 1024)]);
}

#[test]
fn last_chunk_is_short() {
    let mut h = Harness::download(2500, TunnelFupConfig::default());
    h.at(State::Ready);

    assert_eq!(h.chunk_cycle(), ScheduleOp::Delay(Duration::ZERO));
    assert_eq!(h.info.progress.bytes_transferred, 2000);
    assert_eq!(h.chunk_cycle(), ScheduleOp::Done);
    assert_eq!(
        h.transport.last(),
        Some(Sent::Command(PEER_LCC, TunnelOpcode::GetTunnelCommandStatus))
    );
    assert!(h.transport.sent().contains(&Sent::DownloadControl {
        mode: DownloadMode::Download,
        offset: 2000,
        len: 500,
    }));
}

#[test]
fn busy_budget_escalates_to_peer_reset() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.at(State::Ready);
    assert_eq!(h.run(Event::TunnelDownloadRequested), ScheduleOp::Pend);

    for attempt in 1..=5 {
        assert_eq!(h.run(Event::Busy), ScheduleOp::Pend);
        assert_eq!(h.state(), State::SendDownloadControlPage);
        assert_eq!(h.ctx.busy_retry_count(), attempt);
    }
    assert!(!h.peer_reset_requested());

    assert_eq!(
        h.run(Event::Busy),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    assert_eq!(h.state(), State::WaitForReset);
    assert!(h.peer_reset_requested());
    assert_eq!(h.scheduler.set_count(Condition::ExpanderControlNeeded), 1);

    // One original command plus five retries.
    let sends = h
        .transport
        .sent()
        .iter()
        .filter(|s| matches!(s, Sent::DownloadControl { .. }))
        .count();
    assert_eq!(sends, 6);
}

#[test]
fn failure_budget_is_independent_of_busy_budget() {
    let config = TunnelFupConfig {
        max_failure_retry_count: 2,
        ..Default::default()
    };
    let mut h = Harness::download(4096, config);
    h.at(State::Ready);
    h.run(Event::TunnelDownloadRequested);
    h.run(Event::Succeeded);
    assert_eq!(h.state(), State::GetDownloadControlPageStatus);

    for _ in 0..5 {
        assert_eq!(h.run(Event::Busy), ScheduleOp::Pend);
    }
    assert_eq!(h.run(Event::Failed), ScheduleOp::Pend);
    assert_eq!(h.run(Event::Failed), ScheduleOp::Pend);
    assert_eq!(h.state(), State::GetDownloadControlPageStatus);
    assert_eq!(h.ctx.failure_retry_count(), 2);
    assert_eq!(h.ctx.busy_retry_count(), 5);

    assert_eq!(
        h.run(Event::Failed),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    assert_eq!(h.state(), State::WaitForReset);
    assert_eq!(h.scheduler.set_count(Condition::ExpanderControlNeeded), 1);
}

#[test]
fn new_command_gets_fresh_budgets() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.at(State::Ready);
    h.run(Event::TunnelDownloadRequested);
    h.run(Event::Busy);
    h.run(Event::Failed);
    assert_eq!(h.ctx.busy_retry_count(), 1);
    assert_eq!(h.ctx.failure_retry_count(), 1);

    h.run(Event::Succeeded);
    assert_eq!(h.ctx.busy_retry_count(), 0);
    assert_eq!(h.ctx.failure_retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn command_time_limit_overrides_retry_budget() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.at(State::Ready);
    h.run(Event::TunnelDownloadRequested);
    assert_eq!(h.run(Event::Busy), ScheduleOp::Pend);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(
        h.run(Event::Busy),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    assert_eq!(h.state(), State::WaitForReset);
    assert_eq!(h.ctx.busy_retry_count(), 1);
    assert!(h.peer_reset_requested());
}

#[tokio::test(start_paused = true)]
async fn endless_processing_escalates() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.at(State::Ready);
    h.run(Event::TunnelDownloadRequested);
    h.run(Event::Succeeded);

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(h.run(Event::Processing), ScheduleOp::Pend);
        assert_eq!(h.state(), State::GetDownloadControlPageStatus);
    }
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(
        h.run(Event::Processing),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    assert_eq!(h.state(), State::WaitForReset);
}

#[test]
fn invalid_and_concluding_cells_leave_state_alone() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    assert_eq!(h.run(Event::Succeeded), ScheduleOp::Fail);
    assert_eq!(h.state(), State::Init);
    assert_eq!(h.ctx.previous_state(), State::Last);

    h.at(State::GetDownloadControlPageStatus);
    assert_eq!(h.run(Event::TunnelDownloadRequested), ScheduleOp::Fail);
    assert_eq!(h.state(), State::GetDownloadControlPageStatus);

    let mut h = Harness::activate(PEER_LCC);
    h.at(State::GetReceiveDownloadStatusPageStatus);
    h.change_revision(PEER_LCC);
    assert_eq!(h.run(Event::Busy), ScheduleOp::Done);
    assert_eq!(h.state(), State::GetReceiveDownloadStatusPageStatus);
}

#[test]
fn stalled_transfer_resets_peer() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());

    for streak in 1..=3 {
        h.at(State::GetReceiveDownloadStatusPageStatus);
        h.info.progress.current_chunk_size = 0;
        assert_eq!(h.run(Event::Succeeded), ScheduleOp::Delay(Duration::ZERO));
        assert_eq!(h.info.progress.zero_byte_chunks, streak);
        assert_eq!(h.state(), State::Ready);
    }

    h.at(State::GetReceiveDownloadStatusPageStatus);
    assert_eq!(
        h.run(Event::Succeeded),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    assert_eq!(h.state(), State::WaitForReset);
    assert_eq!(h.info.progress.bytes_transferred, 0);
    assert!(h.peer_reset_requested());
}

#[test]
fn nonempty_chunk_clears_stall_streak() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.at(State::GetReceiveDownloadStatusPageStatus);
    h.run(Event::Succeeded);
    assert_eq!(h.info.progress.zero_byte_chunks, 1);

    h.at(State::GetReceiveDownloadStatusPageStatus);
    h.info.progress.current_chunk_size = 10;
    h.run(Event::Succeeded);
    assert_eq!(h.info.progress.zero_byte_chunks, 0);
    assert_eq!(h.info.progress.bytes_transferred, 10);
}

#[test]
fn tunneled_failures_reissue_outer_command() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.at(State::GetReceiveDownloadStatusPageStatus);
    assert_eq!(h.run(Event::TunneledCommandFailed), ScheduleOp::Pend);
    assert_eq!(h.state(), State::ReceiveDownloadStatusPage);
    assert_eq!(
        h.transport.last(),
        Some(Sent::Command(PEER_LCC, TunnelOpcode::GetDownloadStatus))
    );
    assert_eq!(h.ctx.failure_retry_count(), 1);

    h.at(State::GetReceiveDownloadStatusPageStatus);
    h.info.progress.bytes_transferred = 2000;
    assert_eq!(h.run(Event::TunnelDownloadFailed), ScheduleOp::Pend);
    assert_eq!(h.state(), State::SendDownloadControlPage);
    assert_eq!(
        h.transport.last(),
        Some(Sent::DownloadControl {
            mode: DownloadMode::Download,
            offset: 2000,
            len: 2000,
        })
    );
}

#[test]
fn command_that_cannot_be_issued_fails() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.transport.refuse_with(TransportError::ResourceUnavailable);
    assert_eq!(h.run(Event::TunnelDownloadRequested), ScheduleOp::Fail);

    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.info.release_image();
    h.at(State::Ready);
    assert_eq!(h.run(Event::TunnelDownloadRequested), ScheduleOp::Fail);
    assert!(h.transport.sent().is_empty());
}

#[test]
fn activate_sends_empty_control_page() {
    let mut h = Harness::activate(PEER_LCC);
    assert_eq!(h.run(Event::TunnelDownloadRequested), ScheduleOp::Pend);
    assert_eq!(
        h.transport.sent(),
        vec![Sent::DownloadControl {
            mode: DownloadMode::Activate,
            offset: 0,
            len: 0,
        }]
    );
}

#[test]
fn revision_change_beats_transport_errors() {
    for (state, event) in [
        (State::GetDownloadControlPageStatus, Event::Failed),
        (State::GetDownloadControlPageStatus, Event::Busy),
        (State::GetDownloadControlPageStatus, Event::Processing),
        (State::ReceiveDownloadStatusPage, Event::Failed),
        (State::GetReceiveDownloadStatusPageStatus, Event::Busy),
        (State::GetReceiveDownloadStatusPageStatus, Event::Succeeded),
        (State::GetReceiveDownloadStatusPageStatus, Event::TunneledCommandFailed),
    ] {
        let mut h = Harness::activate(PEER_LCC);
        h.at(state);
        h.change_revision(PEER_LCC);
        assert_eq!(h.run(event), ScheduleOp::Done, "{state:?} {event:?}");
        assert!(h.transport.sent().is_empty());
    }
}

#[test]
fn idle_status_completes_activation() {
    let mut h = Harness::activate(PEER_PS);
    h.at(State::GetDownloadControlPageStatus);
    h.info.set_status(FupStatus::None, FupAdditionalStatus::None);
    assert_eq!(h.run(Event::Failed), ScheduleOp::Done);
}

#[test]
fn unchanged_revision_keeps_polling() {
    let mut h = Harness::activate(PEER_LCC);
    h.at(State::GetReceiveDownloadStatusPageStatus);
    assert_eq!(
        h.run(Event::Succeeded),
        ScheduleOp::Delay(h.config.check_rev_poll_time)
    );
    assert_eq!(h.state(), State::GetDownloadControlPageStatus);

    assert_eq!(h.run(Event::Failed), ScheduleOp::Pend);
    assert_eq!(h.state(), State::GetDownloadControlPageStatus);
    assert_eq!(
        h.transport.last(),
        Some(Sent::Command(PEER_LCC, TunnelOpcode::GetTunnelCommandStatus))
    );
}

#[tokio::test(start_paused = true)]
async fn activation_timeout_escalates_to_peer_reset() {
    let mut h = Harness::activate(PEER_LCC);
    assert_eq!(h.run(Event::TunnelDownloadRequested), ScheduleOp::Pend);
    assert_eq!(h.run(Event::Succeeded), ScheduleOp::Pend);
    assert_eq!(h.state(), State::GetDownloadControlPageStatus);

    for _ in 0..7 {
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(h.run(Event::Processing), ScheduleOp::Pend);
        assert_eq!(h.state(), State::GetDownloadControlPageStatus);
    }
    assert_eq!(h.info.status, FupStatus::InProgress);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(
        h.run(Event::Processing),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    assert_eq!(h.state(), State::WaitForReset);
    assert!(h.peer_reset_requested());
}

/// Drive a power supply activation into the reset wait by running out its
/// activation time.
async fn ps_activation_waiting_for_reset() -> Harness {
    let mut h = Harness::activate(PEER_PS);
    h.at(State::GetDownloadControlPageStatus);
    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(
        h.run(Event::Processing),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    assert_eq!(h.state(), State::WaitForReset);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(
        h.run(Event::Failed),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    assert_eq!(h.state(), State::WaitForReset);
    h
}

#[tokio::test(start_paused = true)]
async fn ps_activation_succeeds_if_reset_reveals_revision() {
    let mut h = ps_activation_waiting_for_reset().await;
    h.change_revision(PEER_PS);
    tokio::time::advance(Duration::from_secs(16)).await;
    assert_eq!(h.run(Event::Failed), ScheduleOp::Done);
    assert_eq!(h.state(), State::WaitForReset);
}

#[tokio::test(start_paused = true)]
async fn ps_activation_succeeds_if_reset_leaves_idle_status() {
    let mut h = ps_activation_waiting_for_reset().await;
    h.info.set_status(FupStatus::None, FupAdditionalStatus::None);
    tokio::time::advance(Duration::from_secs(16)).await;
    assert_eq!(h.run(Event::Busy), ScheduleOp::Done);
}

#[tokio::test(start_paused = true)]
async fn ps_activation_fails_if_reset_changes_nothing() {
    let mut h = ps_activation_waiting_for_reset().await;
    tokio::time::advance(Duration::from_secs(16)).await;
    assert_eq!(h.run(Event::Failed), ScheduleOp::Fail);
}

#[tokio::test(start_paused = true)]
async fn download_fails_once_reset_wait_ends() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.at(State::WaitForReset);
    h.ctx.time_marker = Instant::now();
    h.change_revision(PEER_LCC);

    tokio::time::advance(Duration::from_secs(45)).await;
    assert_eq!(
        h.run(Event::Succeeded),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(h.run(Event::Succeeded), ScheduleOp::Fail);
}

#[test]
fn init_keeps_generation_code() {
    let config = TunnelFupConfig::default();
    let mut ctx = TunnelFupContext::new(&config);
    ctx.generation_code = 42;
    ctx.busy_retry_count = 3;
    ctx.current_state = State::WaitForReset;

    ctx.init(State::Ready, Event::TunnelDownloadRequested, &config);
    assert_eq!(ctx.generation_code(), 42);
    assert_eq!(ctx.busy_retry_count(), 0);
    assert_eq!(ctx.current_state(), State::Ready);
    assert_eq!(ctx.previous_state(), State::Last);
}

#[test]
fn peer_is_slot_after_local_lcc() {
    let store = attribute_fixture();
    assert_eq!(peer_reset::peer_lcc_index(&*store), Ok(1));

    // No LCC after the local one.
    let store = InMemoryAttributeStore::new();
    store.add_component(
        ComponentType::Lcc,
        crate::attributes::lcc_attributes(
            0,
            true,
            FwRevision::from_str_lossy(OLD_REVISION),
        ),
    );
    assert!(peer_reset::peer_lcc_index(&store).is_err());
}

#[test]
fn repeated_download_rejection_resets_peer() {
    let mut h = Harness::activate(PEER_LCC);
    for _ in 0..5 {
        h.at(State::GetReceiveDownloadStatusPageStatus);
        assert_eq!(h.run(Event::TunnelDownloadFailed), ScheduleOp::Pend);
        assert_eq!(h.state(), State::SendDownloadControlPage);
        // The resent control page is accepted, which resets the retry
        // budgets but not the rejection count.
        assert_eq!(h.run(Event::Succeeded), ScheduleOp::Pend);
        assert_eq!(h.ctx.failure_retry_count(), 0);
    }
    assert!(!h.peer_reset_requested());

    h.at(State::GetDownloadControlPageStatus);
    assert_eq!(
        h.run(Event::TunnelDownloadFailed),
        ScheduleOp::Delay(h.config.peer_reset_poll_time)
    );
    assert_eq!(h.state(), State::WaitForReset);
    assert!(h.peer_reset_requested());
    assert_eq!(h.ctx.rejected_downloads(), 6);
}

#[test]
fn download_rejections_have_their_own_cells() {
    for table in [FsmTable::Download, FsmTable::Activate] {
        for state in [
            State::GetDownloadControlPageStatus,
            State::GetReceiveDownloadStatusPageStatus,
        ] {
            assert_eq!(
                table.entry(state, Event::TunnelDownloadFailed),
                (
                    Action::HandleDownloadRejected(Step::DownloadControlPage),
                    State::SendDownloadControlPage
                ),
            );
        }
        assert_eq!(
            table.entry(
                State::GetDownloadControlPageStatus,
                Event::TunneledCommandFailed
            )
            .0,
            Action::HandleFailure(Step::DownloadControlPage),
        );
    }
}

#[test]
fn completed_chunk_forgives_rejections() {
    let mut h = Harness::download(4096, TunnelFupConfig::default());
    h.at(State::GetReceiveDownloadStatusPageStatus);
    h.run(Event::TunnelDownloadFailed);
    assert_eq!(h.ctx.rejected_downloads(), 1);

    h.at(State::GetReceiveDownloadStatusPageStatus);
    h.info.progress.current_chunk_size = 2000;
    h.run(Event::Succeeded);
    assert_eq!(h.ctx.rejected_downloads(), 0);
}
