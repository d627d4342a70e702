// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! This crate drives firmware download and activation of components in the
//! peer side of a SAS enclosure, tunneling SES commands through the local
//! expander.
//!
//! The primary entry point is [`EnclosureFup`], whose condition functions are
//! run by a host scheduler. [`FupDriver`] is such a host built on tokio.

pub mod attributes;
pub mod config;
pub mod driver;
pub mod enclosure;
pub mod error;
pub mod fup_info;
pub mod notify;
pub mod scheduler;
pub mod sim;
pub mod status_page;
pub mod transport;
pub mod tunnel_fsm;

#[cfg(test)]
mod testing;

pub use config::TunnelFupConfig;
pub use driver::FupDriver;
pub use driver::FupDriverTask;
pub use driver::FupOutcome;
pub use enclosure::EnclosureFup;
pub use enclosure::EnclosureLocation;
pub use fup_info::FupTarget;
pub use fup_info::FwTargetKind;
pub use transport::Completion;
pub use transport::TunnelTransport;
