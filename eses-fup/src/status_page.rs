// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! Interpretation of the tunnel command status page (83h).

use crate::fup_info::EnclosureFupInfo;
use crate::fup_info::FupAdditionalStatus;
use crate::fup_info::FupStatus;
use crate::transport::EnclosureStatus;
use crate::tunnel_fsm::TunnelFupContext;
use eses_messages::decode_generation_code;
use eses_messages::DownloadStatus;
use eses_messages::DownloadStatusPage;
use eses_messages::PageCode;
use eses_messages::ScsiStatus;
use eses_messages::SenseInfo;
use eses_messages::TunnelDiagStatus;
use eses_messages::TunnelStatusPage;
use slog::debug;
use slog::error;
use slog::warn;
use slog::Logger;

/// Map a tunnel command status page to the status of the tunneled command,
/// recording what it says about the upgrade in `ctx` and `info`.
pub fn handle_tunnel_status_page(
    log: &Logger,
    page: &[u8],
    ctx: &mut TunnelFupContext,
    info: &mut EnclosureFupInfo,
) -> EnclosureStatus {
    match PageCode::of(page) {
        Ok(PageCode::ENCLOSURE_BUSY) => {
            info.additional_status = FupAdditionalStatus::Busy;
            return EnclosureStatus::Busy;
        }
        Ok(PageCode::TUNNEL_DIAGNOSTIC) => (),
        Ok(other) => {
            warn!(log, "unexpected page in place of tunnel status"; "page" => %other);
            info.additional_status = FupAdditionalStatus::ErrorPage;
            return EnclosureStatus::PageInvalid;
        }
        Err(err) => {
            warn!(log, "empty tunnel status page"; "err" => %err);
            info.additional_status = FupAdditionalStatus::ErrorPage;
            return EnclosureStatus::PageInvalid;
        }
    }

    let page = match TunnelStatusPage::decode(page) {
        Ok(page) => page,
        Err(err) => {
            error!(log, "failed to decode tunnel status page"; "err" => %err);
            info.additional_status = FupAdditionalStatus::ErrorPage;
            return EnclosureStatus::PageInvalid;
        }
    };

    let status = page.status();
    match status {
        TunnelDiagStatus::Success => (),
        TunnelDiagStatus::ProcessingLocal | TunnelDiagStatus::ProcessingPeer => {
            info.additional_status = FupAdditionalStatus::TunnelProcessing;
            return EnclosureStatus::ProcessingTunnelCmd;
        }
        other => {
            let name: &'static str = other.into();
            warn!(log, "tunneled command failed"; "tunnel_status" => name);
            return EnclosureStatus::TunneledCmdFailed;
        }
    }

    if let Some(response) = page.scsi_response() {
        if response.status != ScsiStatus::GOOD {
            match SenseInfo::from_sense_data(response.sense) {
                Some(sense) => warn!(
                    log, "tunneled command returned error status";
                    "scsi_status" => ?response.status,
                    "sense_key" => sense.sense_key,
                    "asc" => sense.asc,
                    "ascq" => sense.ascq,
                ),
                None => warn!(
                    log, "tunneled command returned error status";
                    "scsi_status" => ?response.status,
                    "sense_len" => response.sense.len(),
                ),
            }
            return EnclosureStatus::TunneledCmdFailed;
        }
    }

    if page.data.is_empty() {
        return EnclosureStatus::Ok;
    }
    handle_tunneled_data(log, page.data, ctx, info)
}

/// Process the page returned by the tunneled command itself.
fn handle_tunneled_data(
    log: &Logger,
    data: &[u8],
    ctx: &mut TunnelFupContext,
    info: &mut EnclosureFupInfo,
) -> EnclosureStatus {
    let code = match PageCode::of(data) {
        Ok(code) => code,
        Err(_) => return EnclosureStatus::Ok,
    };

    if code == PageCode::ENCLOSURE_BUSY {
        warn!(log, "peer enclosure busy");
        return EnclosureStatus::TunneledCmdFailed;
    }
    if code != ctx.expected_page {
        // Asking too soon can return the previous command's page.
        debug!(
            log, "stale tunneled page";
            "expected" => %ctx.expected_page,
            "got" => %code,
        );
        return EnclosureStatus::ProcessingTunnelCmd;
    }

    match code {
        PageCode::CONFIGURATION => match decode_generation_code(data) {
            Ok(generation_code) => {
                debug!(log, "peer configuration"; "generation_code" => generation_code);
                ctx.generation_code = generation_code;
                EnclosureStatus::Ok
            }
            Err(err) => {
                error!(log, "bad configuration page"; "err" => %err);
                EnclosureStatus::TunneledCmdFailed
            }
        },
        PageCode::DOWNLOAD_MICROCODE => match DownloadStatusPage::decode(data) {
            Ok(status_page) => download_status(log, &status_page, info),
            Err(err) => {
                error!(log, "bad download status page"; "err" => %err);
                EnclosureStatus::TunneledCmdFailed
            }
        },
        other => {
            warn!(log, "unhandled tunneled page"; "page" => %other);
            EnclosureStatus::TunneledCmdFailed
        }
    }
}

fn download_status(
    log: &Logger,
    page: &DownloadStatusPage,
    info: &mut EnclosureFupInfo,
) -> EnclosureStatus {
    let status = page.status();
    let name: &'static str = status.into();
    debug!(
        log, "peer download status";
        "status" => name,
        "additional" => page.descriptor.additional_status,
    );

    match status {
        DownloadStatus::None => {
            info.set_status(FupStatus::None, FupAdditionalStatus::None);
            EnclosureStatus::Ok
        }
        DownloadStatus::InProgress
        | DownloadStatus::UpdatingFlash
        | DownloadStatus::UpdatingNonvolatile
        | DownloadStatus::ImageInUse
        | DownloadStatus::ActivateInProgress => EnclosureStatus::Ok,
        DownloadStatus::NeedsActivate => {
            info.additional_status = FupAdditionalStatus::ImageLoaded;
            EnclosureStatus::Ok
        }
        DownloadStatus::ErrorPageField
        | DownloadStatus::ErrorChecksum
        | DownloadStatus::ErrorTimeout
        | DownloadStatus::ErrorImage
        | DownloadStatus::ErrorBackup
        | DownloadStatus::NoImage
        | DownloadStatus::ActivateFailed
        | DownloadStatus::Unknown(_) => {
            error!(
                log, "peer reported download failure";
                "status" => name,
                "additional" => page.descriptor.additional_status,
            );
            EnclosureStatus::TunnelDlFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelFupConfig;
    use crate::testing::test_logger;
    use eses_messages::encode_config_page;
    use eses_messages::encode_tunnel_status_page;

    fn ctx_expecting(page: PageCode) -> TunnelFupContext {
        let mut ctx = TunnelFupContext::new(&TunnelFupConfig::default());
        ctx.expected_page = page;
        ctx
    }

    fn tunnel_page(
        status: TunnelDiagStatus,
        data: &[u8],
        response: &[u8],
    ) -> Vec<u8> {
        let mut buf = vec![0; 256];
        let n = encode_tunnel_status_page(&mut buf, status, data, response)
            .unwrap();
        buf.truncate(n);
        buf
    }

    fn dl_status(status: DownloadStatus) -> Vec<u8> {
        let mut buf = [0; 24];
        DownloadStatusPage::new(7, 1, status, 0).encode(&mut buf).unwrap();
        buf.to_vec()
    }

    fn handle(page: &[u8], ctx: &mut TunnelFupContext) -> (EnclosureStatus, EnclosureFupInfo) {
        let mut info = EnclosureFupInfo::new();
        info.set_status(FupStatus::InProgress, FupAdditionalStatus::None);
        let status =
            handle_tunnel_status_page(&test_logger(), page, ctx, &mut info);
        (status, info)
    }

    #[test]
    fn outer_page_problems() {
        let mut ctx = ctx_expecting(PageCode::CONFIGURATION);

        let (status, info) = handle(&[0x09, 0, 0, 0], &mut ctx);
        assert_eq!(status, EnclosureStatus::Busy);
        assert_eq!(info.additional_status, FupAdditionalStatus::Busy);

        let (status, info) = handle(&[0x02, 0, 0, 0], &mut ctx);
        assert_eq!(status, EnclosureStatus::PageInvalid);
        assert_eq!(info.additional_status, FupAdditionalStatus::ErrorPage);

        let mut truncated = tunnel_page(TunnelDiagStatus::Success, &[1; 8], &[]);
        truncated.pop();
        let (status, info) = handle(&truncated, &mut ctx);
        assert_eq!(status, EnclosureStatus::PageInvalid);
        assert_eq!(info.additional_status, FupAdditionalStatus::ErrorPage);
    }

    #[test]
    fn tunnel_status_codes() {
        let mut ctx = ctx_expecting(PageCode::CONFIGURATION);

        let page = tunnel_page(TunnelDiagStatus::ProcessingPeer, &[], &[]);
        let (status, info) = handle(&page, &mut ctx);
        assert_eq!(status, EnclosureStatus::ProcessingTunnelCmd);
        assert_eq!(info.additional_status, FupAdditionalStatus::TunnelProcessing);

        let page = tunnel_page(TunnelDiagStatus::FailComm, &[], &[]);
        assert_eq!(handle(&page, &mut ctx).0, EnclosureStatus::TunneledCmdFailed);

        let page = tunnel_page(TunnelDiagStatus::Success, &[], &[]);
        assert_eq!(handle(&page, &mut ctx).0, EnclosureStatus::Ok);
    }

    #[test]
    fn scsi_error_fails_tunneled_command() {
        let mut ctx = ctx_expecting(PageCode::CONFIGURATION);
        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = 0x05;
        sense[12] = 0x26;
        let page = tunnel_page(TunnelDiagStatus::Success, &[], &sense);
        assert_eq!(handle(&page, &mut ctx).0, EnclosureStatus::TunneledCmdFailed);

        // Status byte present and GOOD.
        let mut response = [0u8; 19];
        response[0] = ScsiStatus::GOOD.0;
        let page = tunnel_page(TunnelDiagStatus::Success, &[], &response);
        assert_eq!(handle(&page, &mut ctx).0, EnclosureStatus::Ok);
    }

    #[test]
    fn configuration_page_sets_generation_code() {
        let mut ctx = ctx_expecting(PageCode::CONFIGURATION);
        let mut config = [0; 8];
        encode_config_page(&mut config, 0x1234_5678).unwrap();
        let page = tunnel_page(TunnelDiagStatus::Success, &config, &[]);
        assert_eq!(handle(&page, &mut ctx).0, EnclosureStatus::Ok);
        assert_eq!(ctx.generation_code(), 0x1234_5678);
    }

    #[test]
    fn stale_page_is_processing() {
        let mut ctx = ctx_expecting(PageCode::DOWNLOAD_MICROCODE);
        let mut config = [0; 8];
        encode_config_page(&mut config, 9).unwrap();
        let page = tunnel_page(TunnelDiagStatus::Success, &config, &[]);
        assert_eq!(
            handle(&page, &mut ctx).0,
            EnclosureStatus::ProcessingTunnelCmd
        );
        assert_eq!(ctx.generation_code(), 0);
    }

    #[test]
    fn inner_busy_page_fails_tunneled_command() {
        let mut ctx = ctx_expecting(PageCode::DOWNLOAD_MICROCODE);
        let page = tunnel_page(TunnelDiagStatus::Success, &[0x09, 0, 0, 0], &[]);
        assert_eq!(handle(&page, &mut ctx).0, EnclosureStatus::TunneledCmdFailed);
    }

    #[test]
    fn download_status_mapping() {
        let mut ctx = ctx_expecting(PageCode::DOWNLOAD_MICROCODE);

        let page = tunnel_page(
            TunnelDiagStatus::Success,
            &dl_status(DownloadStatus::None),
            &[],
        );
        let (status, info) = handle(&page, &mut ctx);
        assert_eq!(status, EnclosureStatus::Ok);
        assert!(info.is_idle_status());

        for busy in [
            DownloadStatus::InProgress,
            DownloadStatus::UpdatingFlash,
            DownloadStatus::ActivateInProgress,
        ] {
            let page =
                tunnel_page(TunnelDiagStatus::Success, &dl_status(busy), &[]);
            let (status, info) = handle(&page, &mut ctx);
            assert_eq!(status, EnclosureStatus::Ok, "{busy:?}");
            assert_eq!(info.status, FupStatus::InProgress);
        }

        let page = tunnel_page(
            TunnelDiagStatus::Success,
            &dl_status(DownloadStatus::NeedsActivate),
            &[],
        );
        let (status, info) = handle(&page, &mut ctx);
        assert_eq!(status, EnclosureStatus::Ok);
        assert_eq!(info.additional_status, FupAdditionalStatus::ImageLoaded);

        let page = tunnel_page(
            TunnelDiagStatus::Success,
            &dl_status(DownloadStatus::ErrorChecksum),
            &[],
        );
        assert_eq!(handle(&page, &mut ctx).0, EnclosureStatus::TunnelDlFailed);
    }
}
