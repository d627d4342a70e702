// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! Transition tables. Every `(State, Event)` pair is spelled out so a missing
//! cell fails to compile.

use super::Event;
use super::State;

/// A tunneled command the state machine can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    GetConfiguration,
    DownloadControlPage,
    ReceiveDownloadStatusPage,
    TunnelCommandStatus,
}

/// Handler for a table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// The event cannot happen in this state; fail the operation.
    Invalid,
    /// Start a new tunneled command with fresh retry budgets.
    Send(Step),
    /// Ask the local expander how the last tunneled command went.
    GetTunnelCommandStatus,
    /// The peer is still working; ask again unless it has taken too long.
    HandleProcessing,
    /// Retry `Step` against the failure budget.
    HandleFailure(Step),
    /// The peer rejected the download; retry `Step` unless it has done so
    /// too often this operation.
    HandleDownloadRejected(Step),
    /// Retry `Step` against the busy budget.
    HandleBusy(Step),
    /// A chunk landed; send the next or finish.
    DownloadComplete,
    /// Finish if the activated revision is visible, else poll again later.
    CheckRevision,
    /// Finish if the activated revision is visible, else issue `Step`.
    CheckRevisionAndIssue(Step),
    WaitForReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmTable {
    Download,
    Activate,
}

impl FsmTable {
    /// Handler and default next state for `event` arriving in `state`.
    pub fn entry(self, state: State, event: Event) -> (Action, State) {
        match self {
            FsmTable::Download => download(state, event),
            FsmTable::Activate => activate(state, event),
        }
    }
}

fn download(state: State, event: Event) -> (Action, State) {
    use Action as A;
    use Event as E;
    use State as S;
    use Step::*;

    match (state, event) {
        (S::Init, E::TunnelDownloadRequested) => {
            (A::Send(GetConfiguration), S::SendGetConfig)
        }
        (
            S::Init,
            E::Succeeded
            | E::Processing
            | E::Failed
            | E::Busy
            | E::TunneledCommandFailed
            | E::TunnelDownloadFailed,
        ) => (A::Invalid, S::Init),

        (S::SendGetConfig, E::Succeeded) => {
            (A::GetTunnelCommandStatus, S::Ready)
        }
        (S::SendGetConfig, E::Failed) => {
            (A::HandleFailure(GetConfiguration), S::SendGetConfig)
        }
        (S::SendGetConfig, E::Busy) => {
            (A::HandleBusy(GetConfiguration), S::SendGetConfig)
        }
        (
            S::SendGetConfig,
            E::TunnelDownloadRequested
            | E::Processing
            | E::TunneledCommandFailed
            | E::TunnelDownloadFailed,
        ) => (A::Invalid, S::SendGetConfig),

        (S::Ready, E::TunnelDownloadRequested | E::Succeeded) => {
            (A::Send(DownloadControlPage), S::SendDownloadControlPage)
        }
        (S::Ready, E::Processing) => (A::HandleProcessing, S::Ready),
        (S::Ready, E::Failed) => {
            (A::HandleFailure(TunnelCommandStatus), S::Ready)
        }
        (S::Ready, E::Busy) => (A::HandleBusy(TunnelCommandStatus), S::Ready),
        (S::Ready, E::TunneledCommandFailed) => {
            (A::HandleFailure(GetConfiguration), S::SendGetConfig)
        }
        (S::Ready, E::TunnelDownloadFailed) => (A::Invalid, S::Ready),

        (S::SendDownloadControlPage, E::Succeeded) => {
            (A::GetTunnelCommandStatus, S::GetDownloadControlPageStatus)
        }
        (S::SendDownloadControlPage, E::Failed) => (
            A::HandleFailure(DownloadControlPage),
            S::SendDownloadControlPage,
        ),
        (S::SendDownloadControlPage, E::Busy) => {
            (A::HandleBusy(DownloadControlPage), S::SendDownloadControlPage)
        }
        (
            S::SendDownloadControlPage,
            E::TunnelDownloadRequested
            | E::Processing
            | E::TunneledCommandFailed
            | E::TunnelDownloadFailed,
        ) => (A::Invalid, S::SendDownloadControlPage),

        (S::GetDownloadControlPageStatus, E::Succeeded) => (
            A::Send(ReceiveDownloadStatusPage),
            S::ReceiveDownloadStatusPage,
        ),
        (S::GetDownloadControlPageStatus, E::Processing) => {
            (A::HandleProcessing, S::GetDownloadControlPageStatus)
        }
        (S::GetDownloadControlPageStatus, E::Failed) => (
            A::HandleFailure(TunnelCommandStatus),
            S::GetDownloadControlPageStatus,
        ),
        (S::GetDownloadControlPageStatus, E::Busy) => (
            A::HandleBusy(TunnelCommandStatus),
            S::GetDownloadControlPageStatus,
        ),
        (S::GetDownloadControlPageStatus, E::TunneledCommandFailed) => (
            A::HandleFailure(DownloadControlPage),
            S::SendDownloadControlPage,
        ),
        (S::GetDownloadControlPageStatus, E::TunnelDownloadFailed) => (
            A::HandleDownloadRejected(DownloadControlPage),
            S::SendDownloadControlPage,
        ),
        (S::GetDownloadControlPageStatus, E::TunnelDownloadRequested) => {
            (A::Invalid, S::GetDownloadControlPageStatus)
        }

        (S::ReceiveDownloadStatusPage, E::Succeeded) => (
            A::GetTunnelCommandStatus,
            S::GetReceiveDownloadStatusPageStatus,
        ),
        (S::ReceiveDownloadStatusPage, E::Failed) => (
            A::HandleFailure(ReceiveDownloadStatusPage),
            S::ReceiveDownloadStatusPage,
        ),
        (S::ReceiveDownloadStatusPage, E::Busy) => (
            A::HandleBusy(ReceiveDownloadStatusPage),
            S::ReceiveDownloadStatusPage,
        ),
        (
            S::ReceiveDownloadStatusPage,
            E::TunnelDownloadRequested
            | E::Processing
            | E::TunneledCommandFailed
            | E::TunnelDownloadFailed,
        ) => (A::Invalid, S::ReceiveDownloadStatusPage),

        (S::GetReceiveDownloadStatusPageStatus, E::Succeeded) => {
            (A::DownloadComplete, S::Ready)
        }
        (S::GetReceiveDownloadStatusPageStatus, E::Processing) => {
            (A::HandleProcessing, S::GetReceiveDownloadStatusPageStatus)
        }
        (S::GetReceiveDownloadStatusPageStatus, E::Failed) => (
            A::HandleFailure(TunnelCommandStatus),
            S::GetReceiveDownloadStatusPageStatus,
        ),
        (S::GetReceiveDownloadStatusPageStatus, E::Busy) => (
            A::HandleBusy(TunnelCommandStatus),
            S::GetReceiveDownloadStatusPageStatus,
        ),
        (S::GetReceiveDownloadStatusPageStatus, E::TunneledCommandFailed) => (
            A::HandleFailure(ReceiveDownloadStatusPage),
            S::ReceiveDownloadStatusPage,
        ),
        (S::GetReceiveDownloadStatusPageStatus, E::TunnelDownloadFailed) => (
            A::HandleDownloadRejected(DownloadControlPage),
            S::SendDownloadControlPage,
        ),
        (S::GetReceiveDownloadStatusPageStatus, E::TunnelDownloadRequested) => {
            (A::Invalid, S::GetReceiveDownloadStatusPageStatus)
        }

        (S::WaitForReset, _) => (A::WaitForReset, S::WaitForReset),
        (S::Last, _) => (A::Invalid, S::Last),
    }
}

fn activate(state: State, event: Event) -> (Action, State) {
    use Action as A;
    use Event as E;
    use State as S;
    use Step::*;

    match (state, event) {
        // Activation starts with the generation code already known.
        (
            S::Init | S::SendGetConfig,
            E::TunnelDownloadRequested
            | E::Succeeded
            | E::Processing
            | E::Failed
            | E::Busy
            | E::TunneledCommandFailed
            | E::TunnelDownloadFailed,
        ) => (A::Invalid, state),

        (S::Ready, E::TunnelDownloadRequested) => {
            (A::Send(DownloadControlPage), S::SendDownloadControlPage)
        }
        (
            S::Ready,
            E::Succeeded
            | E::Processing
            | E::Failed
            | E::Busy
            | E::TunneledCommandFailed
            | E::TunnelDownloadFailed,
        ) => (A::Invalid, S::Ready),

        (S::SendDownloadControlPage, E::Succeeded) => {
            (A::GetTunnelCommandStatus, S::GetDownloadControlPageStatus)
        }
        (S::SendDownloadControlPage, E::Failed) => (
            A::HandleFailure(DownloadControlPage),
            S::SendDownloadControlPage,
        ),
        (S::SendDownloadControlPage, E::Busy) => {
            (A::HandleBusy(DownloadControlPage), S::SendDownloadControlPage)
        }
        (
            S::SendDownloadControlPage,
            E::TunnelDownloadRequested
            | E::Processing
            | E::TunneledCommandFailed
            | E::TunnelDownloadFailed,
        ) => (A::Invalid, S::SendDownloadControlPage),

        (S::GetDownloadControlPageStatus, E::Succeeded) => (
            A::Send(ReceiveDownloadStatusPage),
            S::ReceiveDownloadStatusPage,
        ),
        (
            S::GetDownloadControlPageStatus,
            E::Processing | E::Failed | E::Busy,
        ) => (
            A::CheckRevisionAndIssue(TunnelCommandStatus),
            S::GetDownloadControlPageStatus,
        ),
        (S::GetDownloadControlPageStatus, E::TunneledCommandFailed) => (
            A::HandleFailure(DownloadControlPage),
            S::SendDownloadControlPage,
        ),
        (S::GetDownloadControlPageStatus, E::TunnelDownloadFailed) => (
            A::HandleDownloadRejected(DownloadControlPage),
            S::SendDownloadControlPage,
        ),
        (S::GetDownloadControlPageStatus, E::TunnelDownloadRequested) => {
            (A::Invalid, S::GetDownloadControlPageStatus)
        }

        (S::ReceiveDownloadStatusPage, E::Succeeded) => (
            A::GetTunnelCommandStatus,
            S::GetReceiveDownloadStatusPageStatus,
        ),
        (S::ReceiveDownloadStatusPage, E::Failed | E::Busy) => (
            A::CheckRevisionAndIssue(ReceiveDownloadStatusPage),
            S::ReceiveDownloadStatusPage,
        ),
        (
            S::ReceiveDownloadStatusPage,
            E::TunnelDownloadRequested
            | E::Processing
            | E::TunneledCommandFailed
            | E::TunnelDownloadFailed,
        ) => (A::Invalid, S::ReceiveDownloadStatusPage),

        // Re-read the download status until the new revision shows up.
        (S::GetReceiveDownloadStatusPageStatus, E::Succeeded) => {
            (A::CheckRevision, S::GetDownloadControlPageStatus)
        }
        (
            S::GetReceiveDownloadStatusPageStatus,
            E::Processing | E::Failed | E::Busy,
        ) => (
            A::CheckRevisionAndIssue(TunnelCommandStatus),
            S::GetReceiveDownloadStatusPageStatus,
        ),
        (S::GetReceiveDownloadStatusPageStatus, E::TunneledCommandFailed) => (
            A::CheckRevisionAndIssue(ReceiveDownloadStatusPage),
            S::ReceiveDownloadStatusPage,
        ),
        (S::GetReceiveDownloadStatusPageStatus, E::TunnelDownloadFailed) => (
            A::HandleDownloadRejected(DownloadControlPage),
            S::SendDownloadControlPage,
        ),
        (S::GetReceiveDownloadStatusPageStatus, E::TunnelDownloadRequested) => {
            (A::Invalid, S::GetReceiveDownloadStatusPageStatus)
        }

        (S::WaitForReset, _) => (A::WaitForReset, S::WaitForReset),
        (S::Last, _) => (A::Invalid, S::Last),
    }
}
