use dispatch::JobDispatcher;
use idempotency::{LockManager, LockOutcome};
use lambda_runtime::tracing;
use model::request::{ProvisioningRequest, ProvisioningResult};
use model::spec::{NetworkRequestSpec, ValidationError};
use model::status::RequestStatus;
use model::{time, Error, ProvisionJob};
use state::{clamp_page_size, RecordStore, RequestPage, StateError, StateErrorReason};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// How long an idempotency key keeps mapping to the same request.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The surface the submission gateway calls into: idempotent submit,
/// point reads, and per-caller listing.
pub struct SubmissionService {
    store: Arc<dyn RecordStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    locks: LockManager,
    lock_ttl: Duration,
}

/// The answer to a submission, new or replayed.
#[derive(Debug, Clone)]
pub struct Submission {
    pub request_id: String,
    pub status: RequestStatus,
    pub result: Option<ProvisioningResult>,
    pub error_message: Option<String>,
    pub is_new: bool,
}

#[derive(Debug)]
pub enum SubmitError {
    // Malformed spec; rejected before any state was created
    Validation(ValidationError),
    Store(StateError),
    Dispatch(Error),
}

impl Display for SubmitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Validation(err) => write!(f, "invalid request spec: {err}"),
            SubmitError::Store(err) => write!(f, "record store failure: {err}"),
            SubmitError::Dispatch(err) => write!(f, "failed to enqueue job: {err}"),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<ValidationError> for SubmitError {
    fn from(err: ValidationError) -> Self {
        SubmitError::Validation(err)
    }
}

impl From<StateError> for SubmitError {
    fn from(err: StateError) -> Self {
        SubmitError::Store(err)
    }
}

impl SubmissionService {
    pub fn new(store: Arc<dyn RecordStore>, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        SubmissionService {
            locks: LockManager::new(store.clone()),
            store,
            dispatcher,
            lock_ttl: IDEMPOTENCY_TTL,
        }
    }

    pub fn lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    /// Submit a provisioning request.
    ///
    /// Resubmitting with the same (caller, key) inside the idempotency
    /// window answers with the original request id and its current
    /// state instead of provisioning again. The request record is only
    /// written after a confirmed lock acquisition, so a request never
    /// exists without its lock.
    pub async fn submit(
        &self,
        created_by: &str,
        idempotency_key: &str,
        spec: NetworkRequestSpec,
    ) -> Result<Submission, SubmitError> {
        spec.validate()?;

        let lock: LockOutcome = self
            .locks
            .acquire(created_by, idempotency_key, self.lock_ttl)
            .await?;

        if !lock.is_new {
            return self.replay(lock.request_id).await;
        }

        let request = ProvisioningRequest::new(
            lock.request_id.clone(),
            created_by.to_string(),
            idempotency_key.to_string(),
            spec,
            time::now_epoch() + self.lock_ttl.as_secs(),
        );

        self.store.create_request(&request).await?;
        self.dispatcher
            .dispatch(&ProvisionJob {
                request_id: request.request_id.clone(),
            })
            .await
            .map_err(SubmitError::Dispatch)?;

        tracing::info!("Queued request {} for {created_by}", request.request_id);

        Ok(Submission {
            request_id: request.request_id,
            status: RequestStatus::Queued,
            result: None,
            error_message: None,
            is_new: true,
        })
    }

    /// Answer a duplicate submission from the existing record. The
    /// record may not be readable yet if the original submission is
    /// still in flight; report it as queued, as the record will say
    /// once it lands.
    async fn replay(&self, request_id: String) -> Result<Submission, SubmitError> {
        match self.store.get_request(&request_id).await {
            Ok(existing) => Ok(Submission {
                request_id,
                status: existing.status,
                result: Some(existing.result),
                error_message: existing.error_message,
                is_new: false,
            }),
            Err(err) if matches!(err.reason, StateErrorReason::MissingEntry) => Ok(Submission {
                request_id,
                status: RequestStatus::Queued,
                result: None,
                error_message: None,
                is_new: false,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch one request; `None` when the id is unknown. Lock records
    /// never resolve here.
    pub async fn get(&self, request_id: &str) -> Result<Option<ProvisioningRequest>, StateError> {
        match self.store.get_request(request_id).await {
            Ok(request) => Ok(Some(request)),
            Err(err) if matches!(err.reason, StateErrorReason::MissingEntry) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// List a caller's requests in creation-time order, following an
    /// opaque continuation token.
    pub async fn list(
        &self,
        created_by: &str,
        limit: Option<usize>,
        next_token: Option<&str>,
    ) -> Result<RequestPage, StateError> {
        self.store
            .list_requests(created_by, clamp_page_size(limit), next_token)
            .await
    }
}
