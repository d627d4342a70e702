// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use super::FupEnv;
use super::TunnelFupContext;
use crate::attributes::AttributeId;
use crate::attributes::AttributeStore;
use crate::attributes::AttributeValue;
use crate::attributes::ComponentType;
use crate::attributes::PowerCycleRequest;
use crate::error::AttributeError;
use crate::scheduler::Condition;
use slog::error;
use slog::info;
use slog_error_chain::InlineErrorChain;
use tokio::time::Instant;

/// The peer LCC occupies the slot after the local one.
pub(crate) fn peer_lcc_index(
    attributes: &dyn AttributeStore,
) -> Result<usize, AttributeError> {
    let local = attributes.find_first_bool(
        AttributeId::IsLocal,
        ComponentType::Lcc,
        true,
    )?;
    let peer = local + 1;
    if peer >= attributes.component_count(ComponentType::Lcc) {
        return Err(AttributeError::InvalidIndex {
            component: ComponentType::Lcc,
            index: peer,
        });
    }
    Ok(peer)
}

/// Request an immediate power cycle of the peer LCC and start the reset wait.
///
/// The request is only recorded in the attribute store here; setting
/// [`Condition::ExpanderControlNeeded`] gets it sent.
pub(super) fn reset_peer(ctx: &mut TunnelFupContext, env: &mut FupEnv<'_>) {
    match peer_lcc_index(env.attributes) {
        Ok(index) => {
            let writes = [
                (
                    AttributeId::PowerCycleRequest,
                    AttributeValue::PowerCycle(PowerCycleRequest::Begin),
                ),
                (AttributeId::PowerCycleDuration, AttributeValue::U8(0)),
                (AttributeId::PowerCycleDelay, AttributeValue::U8(0)),
            ];
            for (attribute, value) in writes {
                if let Err(err) = env.attributes.set(
                    attribute,
                    ComponentType::Lcc,
                    index,
                    value,
                ) {
                    error!(
                        env.log, "failed to request peer power cycle";
                        "attribute" => ?attribute,
                        "lcc" => index,
                        "err" => %InlineErrorChain::new(&err),
                    );
                }
            }
            info!(env.log, "requested peer LCC power cycle"; "lcc" => index);
        }
        Err(err) => {
            error!(
                env.log, "cannot locate peer LCC to reset";
                "err" => %InlineErrorChain::new(&err),
            );
        }
    }

    env.scheduler.set_condition(Condition::ExpanderControlNeeded);
    ctx.time_marker = Instant::now();
}
