use async_trait::async_trait;
use model::request::{CreatedNetwork, CreatedSubnet, ProvisioningRequest};
use model::status::RequestStatus;
use model::Error;
use std::fmt::{Display, Formatter};

/// Default number of requests returned by a list query.
pub const DEFAULT_PAGE_SIZE: usize = 20;
/// Upper bound on the requested page size.
pub const MAX_PAGE_SIZE: usize = 50;

/// Clamp a caller-supplied page size into the allowed range.
pub fn clamp_page_size(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Outcome of a compare-and-swap status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The record's status no longer matched the expected prior
    /// status. Not an error: the loser reloads and continues.
    Lost { current: RequestStatus },
}

/// Outcome of a conditional checkpoint write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    Recorded,
    /// A concurrent execution checkpointed this step first.
    AlreadyRecorded,
}

/// Outcome of a conditional idempotency-lock create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// A live lock already maps this key to an earlier request.
    Held { target_request_id: String },
}

/// One page of a per-caller request listing.
#[derive(Debug, Clone)]
pub struct RequestPage {
    pub items: Vec<ProvisioningRequest>,
    pub next_token: Option<String>,
}

/// The durable record store holding request and lock records.
///
/// All mutations are conditional writes so that two workers processing
/// the same request during a redelivery race cannot double-apply a
/// step; a lost condition comes back as a value, never an error.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write a fresh request record; fails if the id already exists.
    async fn create_request(&self, request: &ProvisioningRequest) -> Result<(), StateError>;

    async fn get_request(&self, request_id: &str) -> Result<ProvisioningRequest, StateError>;

    /// Move `request_id` from `from` to `to`, conditioned on the
    /// stored status still being `from`.
    async fn transition_status(
        &self,
        request_id: &str,
        from: RequestStatus,
        to: RequestStatus,
        error_message: Option<&str>,
    ) -> Result<Transition, StateError>;

    /// Checkpoint the created network, conditioned on no network id
    /// being recorded yet.
    async fn record_network(
        &self,
        request_id: &str,
        network: &CreatedNetwork,
    ) -> Result<Checkpoint, StateError>;

    /// Checkpoint the created subnet for requested index `index`,
    /// conditioned on exactly `index` subnets being recorded so far.
    async fn record_subnet(
        &self,
        request_id: &str,
        index: usize,
        subnet: &CreatedSubnet,
    ) -> Result<Checkpoint, StateError>;

    /// Conditionally create an idempotency lock mapping `lock_key` to
    /// `target_request_id`, succeeding only if no live lock exists.
    /// An expired lock counts as absent even before TTL sweeps it.
    async fn acquire_lock(
        &self,
        lock_key: &str,
        target_request_id: &str,
        ttl_epoch: u64,
    ) -> Result<LockAttempt, StateError>;

    /// List a caller's requests in creation-time order. `limit` is
    /// expected to be pre-clamped via [`clamp_page_size`].
    async fn list_requests(
        &self,
        created_by: &str,
        limit: usize,
        start_token: Option<&str>,
    ) -> Result<RequestPage, StateError>;
}

/// Errors arising from the record store.
#[derive(Debug)]
pub struct StateError {
    pub key: String,

    pub operation: StateOperation,
    pub reason: StateErrorReason,
}

#[derive(Debug)]
pub enum StateErrorReason {
    // An expected record was missing.
    MissingEntry,
    // The record or the arguments were not of the expected shape.
    BadRecord(String),
    // The store itself failed; retriable.
    BackendFailure(Error),
}

#[derive(Debug, Clone)]
pub enum StateOperation {
    CreateRequest,
    GetRequest,
    TransitionStatus,
    RecordNetwork,
    RecordSubnet,
    AcquireLock,
    ListRequests,
}

impl StateError {
    pub fn new(key: String, operation: StateOperation, reason: StateErrorReason) -> Self {
        StateError {
            key,
            operation,
            reason,
        }
    }
}

impl Display for StateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(format!("{:?}", self).as_str())
    }
}

impl std::error::Error for StateError {}
