//! Conversions between protobuf messages and core types.

use crate::proto::{self, command, rollout_command, secret_sync_command};
use cluster_agent_core::{
    report::Diagnostics, Command, CommandKind, CommandResult, Directive, Identity, Report,
    RolloutAction, SecretSyncAction,
};
use std::time::Duration;

pub(crate) fn identity(id: &Identity) -> proto::Identity {
    proto::Identity {
        cluster_id: id.cluster_id.clone(),
        hostname: id.hostname.clone(),
        version: id.version.clone(),
    }
}

pub(crate) fn snapshot(report: &Report) -> proto::Snapshot {
    proto::Snapshot {
        identity: Some(identity(&report.identity)),
        raw_snapshot: report.raw_snapshot.clone(),
        content_type: report.content_type.clone(),
        api_version: report.api_version.clone(),
        snapshot_ts: report.snapshot_ts.map(prost_types::Timestamp::from),
    }
}

pub(crate) fn diagnostics(diag: &Diagnostics) -> proto::Diagnostics {
    proto::Diagnostics {
        identity: Some(identity(&diag.identity)),
        raw_diagnostics: diag.raw_diagnostics.clone(),
        content_type: diag.content_type.clone(),
        api_version: diag.api_version.clone(),
        snapshot_ts: diag.snapshot_ts.map(prost_types::Timestamp::from),
    }
}

pub(crate) fn command_result(result: &CommandResult) -> proto::CommandResult {
    proto::CommandResult {
        command_id: result.command_id.clone(),
        success: result.success,
        message: result.message.clone(),
    }
}

/// Encodes a report with its timestamp cleared, so that reports differing only by timestamp
/// encode identically.
pub fn report_fingerprint(report: &Report) -> Vec<u8> {
    use prost::Message;

    let mut msg = snapshot(report);
    msg.snapshot_ts = None;
    msg.encode_to_vec()
}

/// Converts a received directive. Fields that cannot be interpreted never fail the directive as a
/// whole; they surface as invalid commands instead.
pub fn directive(msg: proto::Directive) -> Directive {
    let proto::Directive {
        id,
        stop_reporting,
        min_report_period,
        commands,
        enforce_limits,
    } = msg;

    let min_report_period = min_report_period.and_then(|d| Duration::try_from(d).ok());

    Directive {
        id,
        stop_reporting,
        min_report_period,
        enforce_limits,
        commands: commands.into_iter().map(self::command).collect(),
    }
}

fn command(msg: proto::Command) -> Command {
    let id = Some(msg.id).filter(|id| !id.is_empty());
    let kind = match msg.kind {
        None => CommandKind::Unknown,
        Some(command::Kind::Log(proto::LogCommand { message })) => CommandKind::Log { message },
        Some(command::Kind::Rollout(proto::RolloutCommand {
            name,
            namespace,
            action,
        })) => match rollout_action(action) {
            Some(action) => CommandKind::Rollout {
                name,
                namespace,
                action,
            },
            None => CommandKind::Invalid(format!("invalid rollout action {action}")),
        },
        Some(command::Kind::SecretSync(proto::SecretSyncCommand {
            name,
            namespace,
            action,
            secret,
        })) => match secret_sync_action(action) {
            Some(action) => CommandKind::SecretSync {
                name,
                namespace,
                action,
                payload: Some(secret).filter(|s| !s.is_empty()),
            },
            None => CommandKind::Invalid(format!("invalid secret sync action {action}")),
        },
    };
    Command { id, kind }
}

fn rollout_action(action: i32) -> Option<RolloutAction> {
    use rollout_command::Action;
    match Action::try_from(action).ok()? {
        Action::Unspecified => None,
        Action::Pause => Some(RolloutAction::Pause),
        Action::Resume => Some(RolloutAction::Resume),
        Action::Abort => Some(RolloutAction::Abort),
        Action::Promote => Some(RolloutAction::Promote),
        Action::Restart => Some(RolloutAction::Restart),
        Action::Retry => Some(RolloutAction::Retry),
    }
}

fn secret_sync_action(action: i32) -> Option<SecretSyncAction> {
    use secret_sync_command::Action;
    match Action::try_from(action).ok()? {
        Action::Unspecified => None,
        Action::Set => Some(SecretSyncAction::Set),
        Action::Delete => Some(SecretSyncAction::Delete),
    }
}
