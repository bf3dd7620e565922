use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical high-level state of a run.
///
/// `blocked` is orthogonal to the main pipeline — a run can be blocked from
/// almost anywhere and later resume into the phase recorded in its blocked
/// context. `completed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Planning,
    AwaitingPlanApproval,
    Executing,
    AwaitingReview,
    Blocked,
    Completed,
    Cancelled,
}

pub const TERMINAL_PHASES: [Phase; 2] = [Phase::Completed, Phase::Cancelled];

impl Phase {
    pub fn is_terminal(self) -> bool {
        TERMINAL_PHASES.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Planning => "planning",
            Phase::AwaitingPlanApproval => "awaiting_plan_approval",
            Phase::Executing => "executing",
            Phase::AwaitingReview => "awaiting_review",
            Phase::Blocked => "blocked",
            Phase::Completed => "completed",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Phase::Pending),
            "planning" => Ok(Phase::Planning),
            "awaiting_plan_approval" => Ok(Phase::AwaitingPlanApproval),
            "executing" => Ok(Phase::Executing),
            "awaiting_review" => Ok(Phase::AwaitingReview),
            "blocked" => Ok(Phase::Blocked),
            "completed" => Ok(Phase::Completed),
            "cancelled" => Ok(Phase::Cancelled),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// Free-form sub-activity identifier within a phase, e.g.
/// `planner_create_plan`, `implementer_apply_changes`, `cleanup`.
pub type Step = String;

/// Returns the allowed destination phases for a transition out of `from`,
/// per the run state machine's transition table. An empty slice means
/// `from` is terminal.
///
/// Every non-terminal phase can transition straight to `Completed`: besides the
/// ordinary `awaiting_review -> completed` success path, a phase timeout or an
/// unrecoverable worker-side failure marks the run `completed` with
/// `result = failure` from wherever it was (§4.11 `timeout`, `markRunFailed`).
pub fn allowed_transitions(from: Phase) -> &'static [Phase] {
    use Phase::*;
    match from {
        Pending => &[Planning, Completed, Cancelled],
        Planning => &[AwaitingPlanApproval, Blocked, Completed, Cancelled],
        AwaitingPlanApproval => &[Executing, Planning, Completed, Cancelled, Blocked],
        Executing => &[AwaitingReview, Blocked, Completed, Cancelled],
        AwaitingReview => &[Completed, Executing, Blocked, Cancelled],
        Blocked => &[Executing, Planning, Cancelled, Completed],
        Completed => &[],
        Cancelled => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases_have_no_outgoing_transitions() {
        assert!(allowed_transitions(Phase::Completed).is_empty());
        assert!(allowed_transitions(Phase::Cancelled).is_empty());
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Cancelled.is_terminal());
    }

    #[test]
    fn pending_may_advance_to_planning_or_terminate() {
        assert_eq!(
            allowed_transitions(Phase::Pending),
            &[Phase::Planning, Phase::Completed, Phase::Cancelled]
        );
    }

    #[test]
    fn phase_round_trips_through_display_and_from_str() {
        for phase in [
            Phase::Pending,
            Phase::Planning,
            Phase::AwaitingPlanApproval,
            Phase::Executing,
            Phase::AwaitingReview,
            Phase::Blocked,
            Phase::Completed,
            Phase::Cancelled,
        ] {
            let parsed: Phase = phase.to_string().parse().unwrap();
            assert_eq!(parsed, phase);
        }
    }

    #[test]
    fn unknown_phase_string_is_rejected() {
        assert!(Phase::from_str("sleeping").is_err());
    }
}
