//! Job lifecycle state machine
//!
//! ```text
//! Queued ──claim──> Processing ──complete──> Completed
//!   │                 │  │  └──fail(permanent)──> FailedPermanently
//!   │                 │  └──fail(retryable)──> Failed ──claim──> Processing
//!   └──cancel──┬──────┘                          │
//!              └──> CancelledCooperative <───────┘
//! ```
//!
//! Transitions are pure functions of `(state, event)`. Any event against a
//! terminal job is a no-op so redelivered messages are harmless.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{Job, JobFailure, JobStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A worker took the message. `redelivered` is set when the broker hands
    /// the message out again after a previous holder's lease expired.
    Claim { redelivered: bool },
    Complete { result: Value },
    FailRetryable { failure: JobFailure },
    FailPermanent { failure: JobFailure },
    /// A worker observed `cancel_requested` at a checkpoint.
    CancelObserved,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Claim { .. } => "claim",
            JobEvent::Complete { .. } => "complete",
            JobEvent::FailRetryable { .. } => "fail_retryable",
            JobEvent::FailPermanent { .. } => "fail_permanent",
            JobEvent::CancelObserved => "cancel_observed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(JobStatus),
    /// Job already terminal; nothing changes.
    NoOp,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid job transition: {event} from {from}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub event: &'static str,
}

pub fn next_status(current: JobStatus, event: &JobEvent) -> Transition {
    use JobStatus::*;

    if current.is_terminal() {
        return Transition::NoOp;
    }

    match (current, event) {
        (Queued | Failed, JobEvent::Claim { .. }) => Transition::To(Processing),
        // Takeover after the previous holder's lease expired. A fresh duplicate
        // of a message for a job someone else holds is rejected.
        (Processing, JobEvent::Claim { redelivered: true }) => Transition::To(Processing),
        (Processing, JobEvent::Complete { .. }) => Transition::To(Completed),
        (Processing, JobEvent::FailRetryable { .. }) => Transition::To(Failed),
        (Processing, JobEvent::FailPermanent { .. }) => Transition::To(FailedPermanently),
        (Queued | Processing | Failed, JobEvent::CancelObserved) => {
            Transition::To(CancelledCooperative)
        }
        _ => Transition::Rejected,
    }
}

/// Apply `event` to `job`, returning the updated record.
///
/// `Ok(None)` means the event was a no-op against a terminal job.
pub fn apply_event(
    job: &Job,
    event: &JobEvent,
    now: DateTime<Utc>,
) -> Result<Option<Job>, InvalidTransition> {
    let next = match next_status(job.status, event) {
        Transition::NoOp => return Ok(None),
        Transition::Rejected => {
            return Err(InvalidTransition {
                from: job.status,
                event: event.name(),
            })
        }
        Transition::To(next) => next,
    };

    let mut updated = job.clone();
    updated.status = next;
    updated.updated_at = now;

    match event {
        JobEvent::Claim { .. } => {
            updated.attempts += 1;
        }
        JobEvent::Complete { result } => {
            updated.result = Some(result.clone());
            updated.error = None;
        }
        JobEvent::FailRetryable { failure } | JobEvent::FailPermanent { failure } => {
            updated.error = Some(failure.clone());
        }
        JobEvent::CancelObserved => {}
    }

    if next.is_terminal() {
        updated.finished_at = Some(now);
        updated.publish_failed = false;
        updated.next_publish_at = None;
    }

    Ok(Some(updated))
}
