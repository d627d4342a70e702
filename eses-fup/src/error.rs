// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use crate::attributes::AttributeId;
use crate::attributes::ComponentType;
use crate::fup_info::FupOperation;
use crate::fup_info::FupTarget;
use slog_error_chain::SlogInlineError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A tunneled command could not be issued. The outcome of commands that *were*
/// issued arrives later as a [`crate::Completion`], never as this error.
#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum TransportError {
    #[error("no resources available to build the command")]
    ResourceUnavailable,
    #[error("transport to the local expander is not connected")]
    NotConnected,
    #[error("no firmware image is loaded for the download")]
    ImageMissing,
    #[error("failed to encode {page} page")]
    Encode {
        page: &'static str,
        #[source]
        err: eses_messages::EncodeError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum AttributeError {
    #[error("no {component:?} component at index {index}")]
    InvalidIndex { component: ComponentType, index: usize },
    #[error("attribute {attribute:?} is not supported by {component:?}")]
    Unsupported { attribute: AttributeId, component: ComponentType },
    #[error("attribute {attribute:?} holds a value of a different type")]
    TypeMismatch { attribute: AttributeId },
    #[error("no {component:?} component matches side {side}")]
    NotFound { component: ComponentType, side: u8 },
}

#[derive(Debug, Error, SlogInlineError)]
pub enum FupRequestError {
    #[error("firmware operation {0:?} already in progress")]
    OperationInProgress(FupOperation),
    #[error("firmware image cannot be empty")]
    ImageEmpty,
    #[error("firmware image is too large ({0} bytes)")]
    ImageTooLarge(usize),
    #[error("firmware target {target} not found")]
    TargetNotFound {
        target: FupTarget,
        #[source]
        err: AttributeError,
    },
    #[error("firmware target {0} is local; only peer targets are tunneled")]
    TunnellingRequired(FupTarget),
    #[error("no firmware operation to abort")]
    NothingToAbort,
    #[error("firmware upgrade config is invalid")]
    InvalidConfig(#[source] ConfigError),
}

#[derive(Debug, Error, SlogInlineError)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        err: serde_json::Error,
    },
    #[error(
        "max_chunk_size {size} must be a non-zero multiple of 8 no larger \
         than {max}"
    )]
    InvalidChunkSize { size: u32, max: u32 },
}

#[derive(Debug, Error, SlogInlineError)]
pub enum DriverError {
    #[error("transport completion channel closed")]
    CompletionChannelClosed,
}
