//! Payment intent state machine
//!
//! `decide` is a pure function from the current persisted snapshot and a
//! gateway observation to a [`Decision`]. It never touches storage; the engine
//! applies the decision with a compare-and-swap.

use crate::intent::{IntentSnapshot, IntentStatus};

/// What the gateway reported about an intent, from a webhook or a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Succeeded,
    Failed { error: String },
    Canceled,
    /// Still pending on the gateway side (bank confirmation, unpaid, etc.)
    Deferred,
}

impl Observation {
    /// Status the observation would move the intent to, ignoring the ceiling
    pub fn target_status(&self) -> IntentStatus {
        match self {
            Observation::Succeeded => IntentStatus::Succeeded,
            Observation::Failed { .. } => IntentStatus::Failed,
            Observation::Canceled => IntentStatus::Canceled,
            Observation::Deferred => IntentStatus::Processing,
        }
    }
}

/// Row changes for one transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: IntentStatus,
    pub to: IntentStatus,
    /// Replaces `last_error` when set
    pub last_error: Option<String>,
    pub bump_attempts: bool,
    /// Caller must run the side-effect dispatcher after the write lands
    pub fire_side_effect: bool,
    /// Escalated to `failed` because the confirmation ceiling was hit
    pub confirmation_timeout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Same terminal outcome delivered again
    Duplicate,
    /// Non-terminal observation for a terminal intent (out-of-order delivery)
    TerminalSticky,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Advance(Transition),
    /// Already succeeded but the activation never landed
    RetrySideEffect,
    Ignore(IgnoreReason),
    /// Would move an intent out of a terminal state
    Reject {
        current: IntentStatus,
        attempted: IntentStatus,
    },
}

/// Synthetic error recorded when an intent exhausts its confirmation attempts
pub fn confirmation_timeout_error(attempts: i32) -> String {
    format!("confirmation timeout after {attempts} attempts")
}

/// Decide how `observation` affects an intent currently in `snapshot`
///
/// `max_confirmation_attempts` is the number of deferrals tolerated; the
/// deferral that would exceed it escalates the intent to `failed`.
pub fn decide(
    snapshot: &IntentSnapshot,
    observation: &Observation,
    max_confirmation_attempts: i32,
) -> Decision {
    let current = snapshot.status;

    if current.is_terminal() {
        return decide_terminal(snapshot, observation);
    }

    match observation {
        Observation::Succeeded => Decision::Advance(Transition {
            from: current,
            to: IntentStatus::Succeeded,
            last_error: None,
            bump_attempts: false,
            fire_side_effect: snapshot.has_target,
            confirmation_timeout: false,
        }),
        Observation::Failed { error } => Decision::Advance(Transition {
            from: current,
            to: IntentStatus::Failed,
            last_error: Some(error.clone()),
            bump_attempts: false,
            fire_side_effect: false,
            confirmation_timeout: false,
        }),
        Observation::Canceled => Decision::Advance(Transition {
            from: current,
            to: IntentStatus::Canceled,
            last_error: None,
            bump_attempts: false,
            fire_side_effect: false,
            confirmation_timeout: false,
        }),
        Observation::Deferred => {
            let attempts = snapshot.confirmation_attempts.saturating_add(1);
            if attempts > max_confirmation_attempts {
                Decision::Advance(Transition {
                    from: current,
                    to: IntentStatus::Failed,
                    last_error: Some(confirmation_timeout_error(attempts)),
                    bump_attempts: true,
                    fire_side_effect: false,
                    confirmation_timeout: true,
                })
            } else {
                Decision::Advance(Transition {
                    from: current,
                    to: IntentStatus::Processing,
                    last_error: None,
                    bump_attempts: true,
                    fire_side_effect: false,
                    confirmation_timeout: false,
                })
            }
        }
    }
}

fn decide_terminal(snapshot: &IntentSnapshot, observation: &Observation) -> Decision {
    let current = snapshot.status;
    let attempted = observation.target_status();

    match (current, observation) {
        (IntentStatus::Succeeded, Observation::Succeeded) => {
            if snapshot.has_target && !snapshot.side_effect_fired {
                Decision::RetrySideEffect
            } else {
                Decision::Ignore(IgnoreReason::Duplicate)
            }
        }
        (_, Observation::Deferred) => Decision::Ignore(IgnoreReason::TerminalSticky),
        _ if current == attempted => Decision::Ignore(IgnoreReason::Duplicate),
        _ => Decision::Reject { current, attempted },
    }
}
