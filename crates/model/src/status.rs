use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Lifecycle status of a provisioning request.
///
/// Statuses only ever move forward through the chain
/// `QUEUED -> IN_PROGRESS -> NETWORK_CREATED -> SUBNETS_CREATING -> COMPLETED`,
/// with `FAILED` reachable from any non-terminal status.
/// `COMPLETED` and `FAILED` are absorbing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Queued,
    InProgress,
    NetworkCreated,
    SubnetsCreating,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// Whether moving from this status to `next` is a legal transition.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;

        match (*self, next) {
            (Queued, InProgress)
            | (InProgress, NetworkCreated)
            | (NetworkCreated, SubnetsCreating)
            | (SubnetsCreating, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// The stored string form, identical to the serde encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "QUEUED",
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::NetworkCreated => "NETWORK_CREATED",
            RequestStatus::SubnetsCreating => "SUBNETS_CREATING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
        }
    }
}

impl Display for RequestStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
