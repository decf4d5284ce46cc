use lambda_runtime::tracing;
use model::request::{CreatedNetwork, CreatedSubnet, ProvisioningRequest};
use model::spec::{SubnetSpec, MAX_SUBNETS};
use model::status::RequestStatus;
use provider::{network_tags, subnet_tags, NetworkProvider, ProviderError};
use state::StateErrorReason::BadRecord;
use state::StateOperation::RecordNetwork;
use state::{Checkpoint, RecordStore, StateError, Transition};
use std::sync::Arc;

/// What a processed job notification should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal success; acknowledge the notification.
    Completed,
    /// Terminal failure recorded on the request; acknowledge.
    Failed,
    /// Transient trouble; leave the notification outstanding so the
    /// queue redelivers it.
    RetryLater,
}

/// Drives one provisioning request towards a terminal status.
///
/// `process` is reentrant by construction: it re-derives progress from
/// the record's checkpoints, performs only the outstanding steps, and
/// checkpoints each externally visible side effect before advancing.
/// Every status mutation is a compare-and-swap, so a concurrent
/// duplicate execution loses the write, reloads, and continues from
/// the already-advanced record.
pub struct ProvisioningExecutor {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn NetworkProvider>,
}

impl ProvisioningExecutor {
    pub fn new(store: Arc<dyn RecordStore>, provider: Arc<dyn NetworkProvider>) -> Self {
        ProvisioningExecutor { store, provider }
    }

    pub async fn process(&self, request_id: &str) -> Result<Outcome, StateError> {
        let mut request: ProvisioningRequest = self.store.get_request(request_id).await?;

        if let Some(outcome) = terminal_outcome(&request) {
            tracing::info!("Request {request_id} already {}", request.status);

            return Ok(outcome);
        }

        // Records outlive deployments; re-check the bound even though
        // the gateway validated on submission
        if request.spec.subnets.len() > MAX_SUBNETS {
            let reason: String = format!(
                "Too many subnets: {} (max {MAX_SUBNETS})",
                request.spec.subnets.len()
            );

            return self.fail(request_id, request.status, &reason).await;
        }

        if request.status == RequestStatus::Queued {
            request = self.advance(request, RequestStatus::InProgress).await?;

            if let Some(outcome) = terminal_outcome(&request) {
                return Ok(outcome);
            }
        }

        if request.result.network_id.is_none() {
            match self
                .provider
                .create_network(&request.spec.network.cidr, &network_tags(request_id))
                .await
            {
                Ok(network_id) => {
                    tracing::info!("Created network {network_id} for request {request_id}");

                    let created = CreatedNetwork {
                        network_id,
                        network_cidr: request.spec.network.cidr.clone(),
                    };

                    // Checkpoint before any further step; AlreadyRecorded
                    // means a concurrent execution got there first
                    self.store.record_network(request_id, &created).await?;
                    request = self.store.get_request(request_id).await?;
                }
                Err(ProviderError::Transient(err)) => {
                    tracing::warn!("Transient failure creating network for {request_id}: {err}");

                    return Ok(Outcome::RetryLater);
                }
                Err(ProviderError::Terminal(reason)) => {
                    return self.fail(request_id, request.status, &reason).await;
                }
            }
        }

        if request.status == RequestStatus::InProgress {
            request = self.advance(request, RequestStatus::NetworkCreated).await?;
        }

        if request.status == RequestStatus::NetworkCreated {
            request = self.advance(request, RequestStatus::SubnetsCreating).await?;
        }

        if let Some(outcome) = terminal_outcome(&request) {
            return Ok(outcome);
        }

        // Invariant: status is NETWORK_CREATED or later, so the
        // network checkpoint must be present
        let network_id: String = request.result.network_id.clone().ok_or_else(|| {
            StateError::new(
                request_id.to_string(),
                RecordNetwork,
                BadRecord("network checkpoint missing after NETWORK_CREATED".to_string()),
            )
        })?;

        while request.result.subnets.len() < request.spec.subnets.len() {
            let index: usize = request.result.subnets.len();
            let subnet_spec: SubnetSpec = request.spec.subnets[index].clone();

            match self
                .provider
                .create_subnet(
                    &network_id,
                    &subnet_spec.cidr,
                    &subnet_spec.az,
                    &subnet_tags(request_id, subnet_spec.name.as_deref()),
                )
                .await
            {
                Ok(subnet_id) => {
                    tracing::info!(
                        "Created subnet {subnet_id} at index {index} for request {request_id}"
                    );

                    let created = CreatedSubnet {
                        subnet_id,
                        cidr: subnet_spec.cidr,
                        az: subnet_spec.az,
                        name: subnet_spec.name,
                    };

                    match self.store.record_subnet(request_id, index, &created).await? {
                        Checkpoint::Recorded => request.result.subnets.push(created),
                        Checkpoint::AlreadyRecorded => {
                            // A concurrent execution checkpointed this
                            // index; reload and recompute what is left
                            request = self.store.get_request(request_id).await?;

                            if let Some(outcome) = terminal_outcome(&request) {
                                return Ok(outcome);
                            }
                        }
                    }
                }
                Err(ProviderError::Transient(err)) => {
                    tracing::warn!(
                        "Transient failure creating subnet {index} for {request_id}: {err}"
                    );

                    return Ok(Outcome::RetryLater);
                }
                Err(ProviderError::Terminal(reason)) => {
                    return self.fail(request_id, request.status, &reason).await;
                }
            }
        }

        if request.status == RequestStatus::SubnetsCreating {
            request = self.advance(request, RequestStatus::Completed).await?;
        }

        match terminal_outcome(&request) {
            Some(outcome) => Ok(outcome),
            // A concurrent execution holds the record mid-step; let
            // redelivery reconcile
            None => Ok(Outcome::RetryLater),
        }
    }

    /// Attempt a forward transition; on a lost race, reload and
    /// continue from whatever status won.
    async fn advance(
        &self,
        mut request: ProvisioningRequest,
        to: RequestStatus,
    ) -> Result<ProvisioningRequest, StateError> {
        let transition: Transition = self
            .store
            .transition_status(&request.request_id, request.status, to, None)
            .await?;

        match transition {
            Transition::Applied => {
                request.status = to;

                Ok(request)
            }
            Transition::Lost { current } => {
                tracing::info!(
                    "Transition {} -> {to} lost for {}; record is now {current}",
                    request.status,
                    request.request_id
                );

                self.store.get_request(&request.request_id).await
            }
        }
    }

    /// Record a terminal failure. A lost race means another execution
    /// moved the status; retry from wherever it landed, stopping at
    /// any terminal status.
    async fn fail(
        &self,
        request_id: &str,
        mut from: RequestStatus,
        reason: &str,
    ) -> Result<Outcome, StateError> {
        tracing::warn!("Failing request {request_id}: {reason}");

        loop {
            match from {
                RequestStatus::Completed => return Ok(Outcome::Completed),
                RequestStatus::Failed => return Ok(Outcome::Failed),
                _ => {}
            }

            let transition: Transition = self
                .store
                .transition_status(request_id, from, RequestStatus::Failed, Some(reason))
                .await?;

            match transition {
                Transition::Applied => return Ok(Outcome::Failed),
                Transition::Lost { current } => from = current,
            }
        }
    }
}

fn terminal_outcome(request: &ProvisioningRequest) -> Option<Outcome> {
    match request.status {
        RequestStatus::Completed => Some(Outcome::Completed),
        RequestStatus::Failed => Some(Outcome::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::request::ProvisioningRequest;
    use state_in_memory::InMemoryRecordStore;
    use test_utils::{queued_request, FakeFailure, FakeProvider};

    struct Harness {
        store: Arc<InMemoryRecordStore>,
        provider: Arc<FakeProvider>,
        executor: ProvisioningExecutor,
    }

    impl Harness {
        fn new() -> Self {
            let store: Arc<InMemoryRecordStore> = Arc::new(InMemoryRecordStore::default());
            let provider: Arc<FakeProvider> = Arc::new(FakeProvider::default());
            let executor =
                ProvisioningExecutor::new(store.clone(), provider.clone());

            Harness {
                store,
                provider,
                executor,
            }
        }

        async fn seed(&self, request: &ProvisioningRequest) {
            self.store
                .create_request(request)
                .await
                .expect("seed record");
        }
    }

    #[tokio::test]
    async fn provisions_network_and_subnets_to_completion() {
        let harness = Harness::new();
        harness.seed(&queued_request("r1", "alice")).await;

        let outcome: Outcome = harness.executor.process("r1").await.unwrap();
        assert_eq!(Outcome::Completed, outcome);

        let record = harness.store.get_request("r1").await.unwrap();
        assert_eq!(RequestStatus::Completed, record.status);
        assert!(record.result.network_id.is_some());
        assert_eq!(2, record.result.subnets.len());
        assert_eq!("10.0.1.0/24", record.result.subnets[0].cidr);
        assert_eq!(Some("private-b".to_string()), record.result.subnets[1].name);

        assert_eq!(1, harness.provider.network_call_count());
        assert_eq!(2, harness.provider.subnet_call_count());
    }

    #[tokio::test]
    async fn reprocessing_a_completed_request_is_a_no_op() {
        let harness = Harness::new();
        harness.seed(&queued_request("r1", "alice")).await;

        harness.executor.process("r1").await.unwrap();
        let outcome: Outcome = harness.executor.process("r1").await.unwrap();

        assert_eq!(Outcome::Completed, outcome);
        // No additional provider calls on redelivery
        assert_eq!(1, harness.provider.network_call_count());
        assert_eq!(2, harness.provider.subnet_call_count());
    }

    #[tokio::test]
    async fn concurrent_duplicate_execution_creates_nothing_twice() {
        let harness = Harness::new();
        harness.seed(&queued_request("r1", "alice")).await;

        let (first, second) = tokio::join!(
            harness.executor.process("r1"),
            harness.executor.process("r1"),
        );

        assert_eq!(Outcome::Completed, first.unwrap());
        assert_eq!(Outcome::Completed, second.unwrap());
        assert_eq!(1, harness.provider.network_call_count());
        assert_eq!(2, harness.provider.subnet_call_count());
    }

    #[tokio::test]
    async fn resumes_from_checkpointed_subnets() {
        let harness = Harness::new();
        harness.seed(&queued_request("r1", "alice")).await;

        // First attempt: network created, first subnet checkpointed,
        // then the second subnet call fails transiently
        harness
            .provider
            .fail_subnet_at_call(2, FakeFailure::Transient);

        let outcome: Outcome = harness.executor.process("r1").await.unwrap();
        assert_eq!(Outcome::RetryLater, outcome);

        let record = harness.store.get_request("r1").await.unwrap();
        assert_eq!(RequestStatus::SubnetsCreating, record.status);
        assert!(record.result.network_id.is_some());
        assert_eq!(1, record.result.subnets.len());

        // Redelivery finishes the remaining subnet without repeating
        // the network or any checkpointed subnet
        let outcome: Outcome = harness.executor.process("r1").await.unwrap();
        assert_eq!(Outcome::Completed, outcome);

        assert_eq!(1, harness.provider.network_call_count());
        let calls = harness.provider.subnet_calls();
        let first_subnet_calls = calls
            .iter()
            .filter(|(cidr, _)| cidr == "10.0.1.0/24")
            .count();
        assert_eq!(1, first_subnet_calls, "checkpointed subnet was repeated");
    }

    #[tokio::test]
    async fn preseeded_checkpoints_skip_straight_to_the_remaining_work() {
        let harness = Harness::new();
        harness.seed(&queued_request("r1", "alice")).await;

        // Simulate a crashed prior attempt that checkpointed the
        // network and subnet 0
        harness
            .store
            .transition_status("r1", RequestStatus::Queued, RequestStatus::InProgress, None)
            .await
            .unwrap();
        harness
            .store
            .record_network(
                "r1",
                &CreatedNetwork {
                    network_id: "vpc-prior".to_string(),
                    network_cidr: "10.0.0.0/16".to_string(),
                },
            )
            .await
            .unwrap();
        harness
            .store
            .transition_status(
                "r1",
                RequestStatus::InProgress,
                RequestStatus::NetworkCreated,
                None,
            )
            .await
            .unwrap();
        harness
            .store
            .transition_status(
                "r1",
                RequestStatus::NetworkCreated,
                RequestStatus::SubnetsCreating,
                None,
            )
            .await
            .unwrap();
        harness
            .store
            .record_subnet(
                "r1",
                0,
                &CreatedSubnet {
                    subnet_id: "subnet-prior".to_string(),
                    cidr: "10.0.1.0/24".to_string(),
                    az: "eu-west-1a".to_string(),
                    name: None,
                },
            )
            .await
            .unwrap();

        let outcome: Outcome = harness.executor.process("r1").await.unwrap();
        assert_eq!(Outcome::Completed, outcome);

        // Only the outstanding index was created
        assert_eq!(0, harness.provider.network_call_count());
        assert_eq!(
            vec![("10.0.2.0/24".to_string(), "eu-west-1b".to_string())],
            harness.provider.subnet_calls()
        );

        let record = harness.store.get_request("r1").await.unwrap();
        assert_eq!("subnet-prior", record.result.subnets[0].subnet_id);
        assert_eq!(2, record.result.subnets.len());
    }

    #[tokio::test]
    async fn transient_network_failure_retries_without_status_change() {
        let harness = Harness::new();
        harness.seed(&queued_request("r1", "alice")).await;
        harness
            .provider
            .fail_network_at_call(1, FakeFailure::Transient);

        let outcome: Outcome = harness.executor.process("r1").await.unwrap();
        assert_eq!(Outcome::RetryLater, outcome);

        let record = harness.store.get_request("r1").await.unwrap();
        assert_eq!(RequestStatus::InProgress, record.status);
        assert!(record.result.network_id.is_none());
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn terminal_network_failure_fails_the_request() {
        let harness = Harness::new();
        harness.seed(&queued_request("r1", "alice")).await;
        harness.provider.fail_network_at_call(
            1,
            FakeFailure::Terminal("VpcLimitExceeded: quota".to_string()),
        );

        let outcome: Outcome = harness.executor.process("r1").await.unwrap();
        assert_eq!(Outcome::Failed, outcome);

        let record = harness.store.get_request("r1").await.unwrap();
        assert_eq!(RequestStatus::Failed, record.status);
        assert!(record
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("VpcLimitExceeded")));
        assert_eq!(0, harness.provider.subnet_call_count());
    }

    #[tokio::test]
    async fn terminal_subnet_failure_keeps_earlier_checkpoints() {
        let harness = Harness::new();
        harness.seed(&queued_request("r1", "alice")).await;
        harness.provider.fail_subnet_at_call(
            2,
            FakeFailure::Terminal("SubnetLimitExceeded: quota".to_string()),
        );

        let outcome: Outcome = harness.executor.process("r1").await.unwrap();
        assert_eq!(Outcome::Failed, outcome);

        // The first subnet's checkpoint survives the failure and the
        // failure reason is recorded
        let record = harness.store.get_request("r1").await.unwrap();
        assert_eq!(RequestStatus::Failed, record.status);
        assert_eq!(1, record.result.subnets.len());
        assert!(record
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("SubnetLimitExceeded")));
    }

    #[tokio::test]
    async fn failed_requests_are_not_reprocessed() {
        let harness = Harness::new();
        harness.seed(&queued_request("r1", "alice")).await;
        harness
            .provider
            .fail_network_at_call(1, FakeFailure::Terminal("quota".to_string()));

        assert_eq!(Outcome::Failed, harness.executor.process("r1").await.unwrap());
        assert_eq!(Outcome::Failed, harness.executor.process("r1").await.unwrap());

        assert_eq!(1, harness.provider.network_call_count());
    }

    #[tokio::test]
    async fn missing_request_is_an_error() {
        let harness = Harness::new();

        assert!(harness.executor.process("missing").await.is_err());
        assert_eq!(0, harness.provider.network_call_count());
    }

    #[tokio::test]
    async fn oversized_stored_spec_fails_the_request() {
        let harness = Harness::new();
        let mut request = queued_request("r1", "alice");
        let template = request.spec.subnets[0].clone();
        request.spec.subnets = (0..11)
            .map(|i| {
                let mut subnet = template.clone();
                subnet.cidr = format!("10.0.{i}.0/24");
                subnet
            })
            .collect();
        harness.seed(&request).await;

        let outcome: Outcome = harness.executor.process("r1").await.unwrap();

        assert_eq!(Outcome::Failed, outcome);
        assert_eq!(0, harness.provider.network_call_count());
    }
}
