//! Reimbursement workflow states, triggers and transition graph.
//!
//! | From               | Trigger → To                                                     |
//! |--------------------|------------------------------------------------------------------|
//! | CREATED            | SUBMIT → PENDING, START_AUDIT → AI_AUDITING                      |
//! | PENDING            | START_AUDIT → AI_AUDITING, REJECT → REJECTED                     |
//! | AI_AUDITING        | COMPLETE_AUDIT → AI_AUDITED, REJECT → REJECTED                   |
//! | AI_AUDITED         | AUTO_APPROVE → AUTO_APPROVED, REQUEST_REVIEW → IN_REVIEW, REJECT |
//! | IN_REVIEW          | APPROVE → APPROVED, REJECT → REJECTED                            |
//! | AUTO_APPROVED      | APPROVE → APPROVED, REJECT → REJECTED                            |
//! | APPROVED           | START_VOUCHER → VOUCHER_GENERATING                               |
//! | VOUCHER_GENERATING | COMPLETE_VOUCHER → COMPLETED, RETRY → APPROVED                   |
//!
//! `REJECTED` and `COMPLETED` have no outgoing transitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ParseStateError, ParseTriggerError};
use crate::machine::{StateMachine, StateMachineBuilder};

/// Lifecycle state of an approval instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Created,
    Pending,
    AiAuditing,
    AiAudited,
    InReview,
    AutoApproved,
    Approved,
    Rejected,
    VoucherGenerating,
    Completed,
}

impl State {
    pub const ALL: [State; 10] = [
        State::Created,
        State::Pending,
        State::AiAuditing,
        State::AiAudited,
        State::InReview,
        State::AutoApproved,
        State::Approved,
        State::Rejected,
        State::VoucherGenerating,
        State::Completed,
    ];

    /// Name as stored in the instance's status column.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "CREATED",
            State::Pending => "PENDING",
            State::AiAuditing => "AI_AUDITING",
            State::AiAudited => "AI_AUDITED",
            State::InReview => "IN_REVIEW",
            State::AutoApproved => "AUTO_APPROVED",
            State::Approved => "APPROVED",
            State::Rejected => "REJECTED",
            State::VoucherGenerating => "VOUCHER_GENERATING",
            State::Completed => "COMPLETED",
        }
    }

    /// Workflow end points.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Rejected | State::Completed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}

/// Named cause that may move an instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    Submit,
    StartAudit,
    CompleteAudit,
    AutoApprove,
    RequestReview,
    Approve,
    Reject,
    StartVoucher,
    CompleteVoucher,
    Retry,
}

impl Trigger {
    pub const ALL: [Trigger; 10] = [
        Trigger::Submit,
        Trigger::StartAudit,
        Trigger::CompleteAudit,
        Trigger::AutoApprove,
        Trigger::RequestReview,
        Trigger::Approve,
        Trigger::Reject,
        Trigger::StartVoucher,
        Trigger::CompleteVoucher,
        Trigger::Retry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Submit => "SUBMIT",
            Trigger::StartAudit => "START_AUDIT",
            Trigger::CompleteAudit => "COMPLETE_AUDIT",
            Trigger::AutoApprove => "AUTO_APPROVE",
            Trigger::RequestReview => "REQUEST_REVIEW",
            Trigger::Approve => "APPROVE",
            Trigger::Reject => "REJECT",
            Trigger::StartVoucher => "START_VOUCHER",
            Trigger::CompleteVoucher => "COMPLETE_VOUCHER",
            Trigger::Retry => "RETRY",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = ParseTriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Trigger::ALL
            .into_iter()
            .find(|trigger| trigger.as_str() == s)
            .ok_or_else(|| ParseTriggerError(s.to_string()))
    }
}

/// Machine type driven by the workflow engine.
pub type ReimbursementMachine = StateMachine<State, Trigger>;

/// Builder type accepted by the workflow engine.
pub type ReimbursementBuilder = StateMachineBuilder<State, Trigger>;

/// Blueprint of the reimbursement approval graph.
pub fn reimbursement_blueprint() -> ReimbursementBuilder {
    let mut builder = StateMachineBuilder::new();

    builder
        .configure(State::Created)
        .permit(Trigger::Submit, State::Pending)
        .permit(Trigger::StartAudit, State::AiAuditing);

    builder
        .configure(State::Pending)
        .permit(Trigger::StartAudit, State::AiAuditing)
        .permit(Trigger::Reject, State::Rejected);

    builder
        .configure(State::AiAuditing)
        .permit(Trigger::CompleteAudit, State::AiAudited)
        .permit(Trigger::Reject, State::Rejected);

    builder
        .configure(State::AiAudited)
        .permit(Trigger::AutoApprove, State::AutoApproved)
        .permit(Trigger::RequestReview, State::InReview)
        .permit(Trigger::Reject, State::Rejected);

    builder
        .configure(State::InReview)
        .permit(Trigger::Approve, State::Approved)
        .permit(Trigger::Reject, State::Rejected);

    builder
        .configure(State::AutoApproved)
        .permit(Trigger::Approve, State::Approved)
        .permit(Trigger::Reject, State::Rejected);

    builder
        .configure(State::Approved)
        .permit(Trigger::StartVoucher, State::VoucherGenerating);

    builder
        .configure(State::VoucherGenerating)
        .permit(Trigger::CompleteVoucher, State::Completed)
        .permit(Trigger::Retry, State::Approved);

    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn test_state_wire_names_round_trip() {
        for state in State::ALL {
            assert_eq!(state.as_str().parse::<State>(), Ok(state));
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.as_str().to_string())
            );
        }
        assert_eq!(
            "ARCHIVED".parse::<State>(),
            Err(ParseStateError("ARCHIVED".into()))
        );
        assert!("created".parse::<State>().is_err());
    }

    #[test]
    fn test_trigger_wire_names_round_trip() {
        for trigger in Trigger::ALL {
            assert_eq!(trigger.as_str().parse::<Trigger>(), Ok(trigger));
            assert_eq!(
                serde_json::to_value(trigger).unwrap(),
                serde_json::Value::String(trigger.as_str().to_string())
            );
        }
        assert!("ESCALATE".parse::<Trigger>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<State> = State::ALL.into_iter().filter(State::is_terminal).collect();
        assert_eq!(terminal, vec![State::Rejected, State::Completed]);
    }

    #[test]
    fn test_blueprint_matches_graph() {
        let builder = reimbursement_blueprint();
        let expected: &[(State, &[(Trigger, State)])] = &[
            (
                State::Created,
                &[
                    (Trigger::Submit, State::Pending),
                    (Trigger::StartAudit, State::AiAuditing),
                ],
            ),
            (
                State::Pending,
                &[
                    (Trigger::StartAudit, State::AiAuditing),
                    (Trigger::Reject, State::Rejected),
                ],
            ),
            (
                State::AiAuditing,
                &[
                    (Trigger::CompleteAudit, State::AiAudited),
                    (Trigger::Reject, State::Rejected),
                ],
            ),
            (
                State::AiAudited,
                &[
                    (Trigger::AutoApprove, State::AutoApproved),
                    (Trigger::RequestReview, State::InReview),
                    (Trigger::Reject, State::Rejected),
                ],
            ),
            (
                State::InReview,
                &[
                    (Trigger::Approve, State::Approved),
                    (Trigger::Reject, State::Rejected),
                ],
            ),
            (
                State::AutoApproved,
                &[
                    (Trigger::Approve, State::Approved),
                    (Trigger::Reject, State::Rejected),
                ],
            ),
            (
                State::Approved,
                &[(Trigger::StartVoucher, State::VoucherGenerating)],
            ),
            (
                State::VoucherGenerating,
                &[
                    (Trigger::CompleteVoucher, State::Completed),
                    (Trigger::Retry, State::Approved),
                ],
            ),
            (State::Rejected, &[]),
            (State::Completed, &[]),
        ];

        let ctx = Context::new();
        for (from, edges) in expected {
            let machine = builder.build(*from);
            let permitted: Vec<Trigger> = edges.iter().map(|(t, _)| *t).collect();
            assert_eq!(machine.permitted_triggers(), permitted, "from {}", from);

            for (trigger, to) in *edges {
                let mut machine = builder.build(*from);
                assert_eq!(machine.fire(&ctx, *trigger), Ok(*to));
            }
        }
    }

    #[test]
    fn test_voucher_retry_loop_terminates() {
        let ctx = Context::new();
        let mut machine = reimbursement_blueprint().build(State::VoucherGenerating);

        assert_eq!(machine.fire(&ctx, Trigger::Retry), Ok(State::Approved));
        assert_eq!(
            machine.fire(&ctx, Trigger::StartVoucher),
            Ok(State::VoucherGenerating)
        );
        assert_eq!(
            machine.fire(&ctx, Trigger::CompleteVoucher),
            Ok(State::Completed)
        );
        assert!(machine.is_terminal());
    }
}
