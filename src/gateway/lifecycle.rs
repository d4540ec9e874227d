//! Request state machine for one `/server_calls` exchange.
//!
//! ```text
//! Received -> Validated -> Distributed -> AwaitingResults -> Aggregated -> Responded
//! Received -> Rejected                                  (400)
//! AwaitingResults -> Failed                             (500)
//! ```

use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

use crate::observability::RequestId;

/// Phase of a batched request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Received,
    Validated,
    Distributed,
    AwaitingResults,
    Aggregated,
    Responded,
    Rejected,
    Failed,
}

impl CallPhase {
    pub fn can_transition_to(self, next: CallPhase) -> bool {
        use CallPhase::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Rejected)
                | (Validated, Distributed)
                | (Distributed, AwaitingResults)
                | (AwaitingResults, Aggregated)
                | (AwaitingResults, Failed)
                | (Aggregated, Responded)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallPhase::Received => "received",
            CallPhase::Validated => "validated",
            CallPhase::Distributed => "distributed",
            CallPhase::AwaitingResults => "awaiting_results",
            CallPhase::Aggregated => "aggregated",
            CallPhase::Responded => "responded",
            CallPhase::Rejected => "rejected",
            CallPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks and logs the phases of one request
#[derive(Debug)]
pub struct RequestLifecycle {
    request_id: RequestId,
    phase: CallPhase,
    started: Instant,
}

impl RequestLifecycle {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            phase: CallPhase::Received,
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Move to `next`; illegal transitions are logged and ignored
    pub fn advance(&mut self, next: CallPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            warn!(
                request_id = %self.request_id,
                from = %self.phase,
                to = %next,
                "Illegal request phase transition"
            );
            return false;
        }

        debug!(request_id = %self.request_id, from = %self.phase, to = %next, "Request phase");
        self.phase = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lifecycle = RequestLifecycle::new(RequestId::new());
        for phase in [
            CallPhase::Validated,
            CallPhase::Distributed,
            CallPhase::AwaitingResults,
            CallPhase::Aggregated,
            CallPhase::Responded,
        ] {
            assert!(lifecycle.advance(phase));
        }
        assert_eq!(lifecycle.phase(), CallPhase::Responded);
        assert!(!lifecycle.advance(CallPhase::Failed));
    }

    #[test]
    fn test_rejection_only_from_received() {
        assert!(CallPhase::Received.can_transition_to(CallPhase::Rejected));
        assert!(!CallPhase::Distributed.can_transition_to(CallPhase::Rejected));
        assert!(CallPhase::AwaitingResults.can_transition_to(CallPhase::Failed));
        assert!(!CallPhase::Validated.can_transition_to(CallPhase::Failed));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(CallPhase::Responded.as_str(), "responded");
        assert_eq!(CallPhase::Rejected.to_string(), "rejected");
        assert_eq!(CallPhase::Failed.as_str(), "failed");
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let mut lifecycle = RequestLifecycle::new(RequestId::new());
        assert!(!lifecycle.advance(CallPhase::Aggregated));
        assert_eq!(lifecycle.phase(), CallPhase::Received);
    }
}
