// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use super::FupEnv;
use super::TunnelFupContext;
use crate::fup_info::FwTargetKind;
use slog::error;
use slog::info;
use slog_error_chain::InlineErrorChain;
use tokio::time::Instant;

/// True once the target reports a revision other than the one captured when
/// the operation started.
pub(super) fn revision_changed(
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
) -> bool {
    let Some(target) = env.info.target else {
        error!(env.log, "no firmware target to check revision of");
        return false;
    };
    let component = target.kind.component_type();

    let current = match env
        .attributes
        .index_for_side(component, target.side)
        .and_then(|index| env.attributes.get_revision(component, index))
    {
        Ok(rev) => rev,
        Err(err) => {
            error!(
                env.log, "failed to read firmware revision";
                "target" => %target,
                "err" => %InlineErrorChain::new(&err),
            );
            return false;
        }
    };

    if current != env.info.old_revision {
        info!(
            env.log, "firmware revision changed";
            "target" => %target,
            "old" => %env.info.old_revision,
            "new" => %current,
        );
        return true;
    }

    let now = Instant::now();
    let interval = env.config.activation_log_interval(target.kind);
    if now.saturating_duration_since(ctx.time_marker) >= interval {
        let elapsed = now.saturating_duration_since(env.info.start_time);
        if target.kind == FwTargetKind::PowerSupply {
            info!(
                env.log, "waiting for activated revision";
                "target" => %target,
                "elapsed_min" => elapsed.as_secs() / 60,
            );
        } else {
            info!(
                env.log, "waiting for activated revision";
                "target" => %target,
                "elapsed_s" => elapsed.as_secs(),
            );
        }
        ctx.time_marker = now;
    }
    false
}
