//! Command lifecycle tracker
//!
//! Centralizes the command status state machine so legality is enforced in
//! one place rather than scattered across call sites. Legal edges:
//! `pending -> sent`, `sent -> executing`, `executing -> completed`,
//! `executing -> failed`, `pending -> cancelled`. The three terminal states
//! (`completed`, `failed`, `cancelled`) accept no further status mutation,
//! regardless of the update's sequence number.

use chrono::{DateTime, Utc};

use super::error::InvalidTransitionError;
use super::model::{Command, CommandId, CommandStatus, CommandUpdate};

/// Check a requested status transition against the legality table
///
/// Re-asserting the current status is not a transition: at-least-once push
/// delivery duplicates updates, and the terminal-stickiness invariant only
/// forbids mutation. Such refreshes are accepted as no-ops.
pub fn validate_transition(
    command_id: &CommandId,
    from: CommandStatus,
    to: CommandStatus,
) -> Result<(), InvalidTransitionError> {
    use CommandStatus::*;

    if from == to {
        return Ok(());
    }

    let legal = matches!(
        (from, to),
        (Pending, Sent) | (Sent, Executing) | (Executing, Completed) | (Executing, Failed)
            | (Pending, Cancelled)
    );

    if legal {
        Ok(())
    } else {
        Err(InvalidTransitionError {
            command_id: command_id.clone(),
            from,
            to,
        })
    }
}

/// Apply a validated update to a stored command
///
/// Callers must have run [`validate_transition`] first; this function only
/// enforces field placement: `executed_at` is set on entry to `executing` or
/// later, `result` only on entry to `completed`, `error_message` only on
/// entry to `failed`.
pub fn apply_update(command: &mut Command, update: &CommandUpdate, now: DateTime<Utc>) {
    use CommandStatus::*;

    let from = command.status;
    let to = update.status.unwrap_or(from);

    if let Some(priority) = update.priority {
        command.priority = priority;
    }
    if let Some(parameters) = &update.parameters {
        command.parameters = parameters.clone();
    }

    if to != from {
        command.status = to;

        match to {
            Executing | Completed | Failed => {
                command.executed_at = update.executed_at.or(command.executed_at).or(Some(now));
            }
            _ => {}
        }
        if to == Completed {
            command.result = update.result.clone();
        }
        if to == Failed {
            command.error_message = update.error_message.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{DeviceId, Priority, Seq};

    fn command(status: CommandStatus) -> Command {
        Command {
            command_id: CommandId::new("c1"),
            device_id: DeviceId::new("d1"),
            command_type: "location".to_string(),
            parameters: serde_json::json!({}),
            priority: Priority::Normal,
            status,
            created_at: Utc::now(),
            executed_at: None,
            result: None,
            error_message: None,
            seq: Seq(1),
        }
    }

    #[test]
    fn legal_edges_accepted() {
        use CommandStatus::*;
        let id = CommandId::new("c1");
        for (from, to) in [
            (Pending, Sent),
            (Sent, Executing),
            (Executing, Completed),
            (Executing, Failed),
            (Pending, Cancelled),
        ] {
            assert!(validate_transition(&id, from, to).is_ok(), "{from} -> {to}");
        }
    }

    #[test]
    fn illegal_edges_rejected() {
        use CommandStatus::*;
        let id = CommandId::new("c1");
        let all = [Pending, Sent, Executing, Completed, Failed, Cancelled];
        let legal = [
            (Pending, Sent),
            (Sent, Executing),
            (Executing, Completed),
            (Executing, Failed),
            (Pending, Cancelled),
        ];
        for from in all {
            for to in all {
                if from == to || legal.contains(&(from, to)) {
                    continue;
                }
                let err = validate_transition(&id, from, to).unwrap_err();
                assert_eq!(err.from, from);
                assert_eq!(err.to, to);
            }
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        use CommandStatus::*;
        let id = CommandId::new("c1");
        for from in [Completed, Failed, Cancelled] {
            for to in [Pending, Sent, Executing, Completed, Failed, Cancelled] {
                if from == to {
                    continue;
                }
                assert!(validate_transition(&id, from, to).is_err());
            }
        }
    }

    #[test]
    fn same_status_is_a_refresh() {
        let id = CommandId::new("c1");
        assert!(validate_transition(&id, CommandStatus::Completed, CommandStatus::Completed).is_ok());
    }

    #[test]
    fn result_only_on_completion() {
        let mut cmd = command(CommandStatus::Sent);
        let mut update = CommandUpdate::new(cmd.command_id.clone());
        update.status = Some(CommandStatus::Executing);
        update.result = Some(serde_json::json!({"lat": 1.0}));
        apply_update(&mut cmd, &update, Utc::now());

        assert_eq!(cmd.status, CommandStatus::Executing);
        assert!(cmd.result.is_none(), "result must wait for completion");
        assert!(cmd.executed_at.is_some(), "executed_at set on entry to executing");
    }

    #[test]
    fn error_message_only_on_failure() {
        let mut cmd = command(CommandStatus::Executing);
        let mut update = CommandUpdate::new(cmd.command_id.clone());
        update.status = Some(CommandStatus::Completed);
        update.error_message = Some("boom".to_string());
        apply_update(&mut cmd, &update, Utc::now());

        assert_eq!(cmd.status, CommandStatus::Completed);
        assert!(cmd.error_message.is_none());
    }
}
