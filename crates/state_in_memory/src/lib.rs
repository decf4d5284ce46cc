use async_trait::async_trait;
use model::request::{CreatedNetwork, CreatedSubnet, ProvisioningRequest};
use model::status::RequestStatus;
use model::time;
use state::StateErrorReason::{BadRecord, MissingEntry};
use state::StateOperation::{
    CreateRequest, GetRequest, ListRequests, RecordNetwork, RecordSubnet, TransitionStatus,
};
use state::{Checkpoint, LockAttempt, RecordStore, RequestPage, StateError, Transition};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory [`RecordStore`] with the same conditional-write semantics
/// as the DynamoDB implementation, for tests and local runs.
pub struct InMemoryRecordStore {
    records: Arc<Mutex<HashMap<String, ProvisioningRequest>>>,
    locks: Arc<Mutex<HashMap<String, StoredLock>>>,
}

#[derive(Clone)]
struct StoredLock {
    target_request_id: String,
    ttl_epoch: u64,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        InMemoryRecordStore {
            records: Arc::new(Mutex::new(Default::default())),
            locks: Arc::new(Mutex::new(Default::default())),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_request(&self, request: &ProvisioningRequest) -> Result<(), StateError> {
        let mut records = self.records.lock().unwrap();

        if records.contains_key(&request.request_id) {
            return Err(StateError::new(
                request.request_id.clone(),
                CreateRequest,
                BadRecord("request already exists".to_string()),
            ));
        }

        records.insert(request.request_id.clone(), request.clone());

        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> Result<ProvisioningRequest, StateError> {
        let records = self.records.lock().unwrap();

        let request: ProvisioningRequest = records
            .get(request_id)
            .ok_or_else(|| StateError::new(request_id.to_string(), GetRequest, MissingEntry))?
            .clone();

        Ok(request)
    }

    async fn transition_status(
        &self,
        request_id: &str,
        from: RequestStatus,
        to: RequestStatus,
        error_message: Option<&str>,
    ) -> Result<Transition, StateError> {
        if !from.can_transition_to(to) {
            return Err(StateError::new(
                request_id.to_string(),
                TransitionStatus,
                BadRecord(format!("illegal transition {from} -> {to}")),
            ));
        }

        let mut records = self.records.lock().unwrap();
        let request: &mut ProvisioningRequest = records
            .get_mut(request_id)
            .ok_or_else(|| StateError::new(request_id.to_string(), TransitionStatus, MissingEntry))?;

        if request.status != from {
            return Ok(Transition::Lost {
                current: request.status,
            });
        }

        request.status = to;
        request.updated_at = time::now_iso();
        if let Some(message) = error_message {
            request.error_message = Some(message.to_string());
        }

        Ok(Transition::Applied)
    }

    async fn record_network(
        &self,
        request_id: &str,
        network: &CreatedNetwork,
    ) -> Result<Checkpoint, StateError> {
        let mut records = self.records.lock().unwrap();
        let request: &mut ProvisioningRequest = records
            .get_mut(request_id)
            .ok_or_else(|| StateError::new(request_id.to_string(), RecordNetwork, MissingEntry))?;

        if request.result.network_id.is_some() {
            return Ok(Checkpoint::AlreadyRecorded);
        }

        request.result.network_id = Some(network.network_id.clone());
        request.result.network_cidr = Some(network.network_cidr.clone());
        request.updated_at = time::now_iso();

        Ok(Checkpoint::Recorded)
    }

    async fn record_subnet(
        &self,
        request_id: &str,
        index: usize,
        subnet: &CreatedSubnet,
    ) -> Result<Checkpoint, StateError> {
        let mut records = self.records.lock().unwrap();
        let request: &mut ProvisioningRequest = records
            .get_mut(request_id)
            .ok_or_else(|| StateError::new(request_id.to_string(), RecordSubnet, MissingEntry))?;

        if request.result.subnets.len() != index {
            return Ok(Checkpoint::AlreadyRecorded);
        }

        request.result.subnets.push(subnet.clone());
        request.updated_at = time::now_iso();

        Ok(Checkpoint::Recorded)
    }

    async fn acquire_lock(
        &self,
        lock_key: &str,
        target_request_id: &str,
        ttl_epoch: u64,
    ) -> Result<LockAttempt, StateError> {
        let mut locks = self.locks.lock().unwrap();
        let now: u64 = time::now_epoch();

        if let Some(existing) = locks.get(lock_key) {
            if existing.ttl_epoch > now {
                return Ok(LockAttempt::Held {
                    target_request_id: existing.target_request_id.clone(),
                });
            }
        }

        locks.insert(
            lock_key.to_string(),
            StoredLock {
                target_request_id: target_request_id.to_string(),
                ttl_epoch,
            },
        );

        Ok(LockAttempt::Acquired)
    }

    async fn list_requests(
        &self,
        created_by: &str,
        limit: usize,
        start_token: Option<&str>,
    ) -> Result<RequestPage, StateError> {
        let records = self.records.lock().unwrap();

        let mut matching: Vec<ProvisioningRequest> = records
            .values()
            .filter(|request| request.created_by == created_by)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            (a.created_at.as_str(), a.request_id.as_str())
                .cmp(&(b.created_at.as_str(), b.request_id.as_str()))
        });

        // The continuation token is the id of the last returned item;
        // anything else is rejected, as the DynamoDB store does for a
        // malformed token
        let start: usize = match start_token {
            Some(token) => match matching.iter().position(|r| r.request_id == token) {
                Some(position) => position + 1,
                None => {
                    return Err(StateError::new(
                        created_by.to_string(),
                        ListRequests,
                        BadRecord(format!("invalid next_token: '{token}'")),
                    ))
                }
            },
            None => 0,
        };

        let items: Vec<ProvisioningRequest> =
            matching.iter().skip(start).take(limit).cloned().collect();
        let next_token: Option<String> = if start + items.len() < matching.len() {
            items.last().map(|r| r.request_id.clone())
        } else {
            None
        };

        Ok(RequestPage { items, next_token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::spec::{NetworkRequestSpec, NetworkSpec, SubnetSpec};

    fn request(request_id: &str, created_by: &str) -> ProvisioningRequest {
        ProvisioningRequest::new(
            request_id.to_string(),
            created_by.to_string(),
            "key-1".to_string(),
            NetworkRequestSpec {
                network: NetworkSpec {
                    cidr: "10.0.0.0/16".to_string(),
                },
                subnets: vec![SubnetSpec {
                    cidr: "10.0.1.0/24".to_string(),
                    az: "eu-west-1a".to_string(),
                    name: None,
                }],
            },
            time::now_epoch() + 60,
        )
    }

    #[tokio::test]
    async fn create_is_conditional_on_absence() {
        let store = InMemoryRecordStore::default();

        store.create_request(&request("r1", "alice")).await.unwrap();
        let duplicate = store.create_request(&request("r1", "alice")).await;

        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let store = InMemoryRecordStore::default();
        store.create_request(&request("r1", "alice")).await.unwrap();

        let applied = store
            .transition_status("r1", RequestStatus::Queued, RequestStatus::InProgress, None)
            .await
            .unwrap();
        assert_eq!(Transition::Applied, applied);

        // A second worker attempting the same transition loses
        let lost = store
            .transition_status("r1", RequestStatus::Queued, RequestStatus::InProgress, None)
            .await
            .unwrap();
        assert_eq!(
            Transition::Lost {
                current: RequestStatus::InProgress
            },
            lost
        );
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let store = InMemoryRecordStore::default();
        store.create_request(&request("r1", "alice")).await.unwrap();

        let result = store
            .transition_status("r1", RequestStatus::Queued, RequestStatus::Completed, None)
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn network_checkpoint_applies_once() {
        let store = InMemoryRecordStore::default();
        store.create_request(&request("r1", "alice")).await.unwrap();

        let network = CreatedNetwork {
            network_id: "vpc-1".to_string(),
            network_cidr: "10.0.0.0/16".to_string(),
        };

        assert_eq!(
            Checkpoint::Recorded,
            store.record_network("r1", &network).await.unwrap()
        );
        assert_eq!(
            Checkpoint::AlreadyRecorded,
            store.record_network("r1", &network).await.unwrap()
        );

        let stored = store.get_request("r1").await.unwrap();
        assert_eq!(Some("vpc-1".to_string()), stored.result.network_id);
    }

    #[tokio::test]
    async fn subnet_checkpoint_is_conditional_on_index() {
        let store = InMemoryRecordStore::default();
        store.create_request(&request("r1", "alice")).await.unwrap();

        let subnet = CreatedSubnet {
            subnet_id: "subnet-1".to_string(),
            cidr: "10.0.1.0/24".to_string(),
            az: "eu-west-1a".to_string(),
            name: None,
        };

        // Index 1 can't be recorded before index 0
        assert_eq!(
            Checkpoint::AlreadyRecorded,
            store.record_subnet("r1", 1, &subnet).await.unwrap()
        );
        assert_eq!(
            Checkpoint::Recorded,
            store.record_subnet("r1", 0, &subnet).await.unwrap()
        );
        assert_eq!(
            Checkpoint::AlreadyRecorded,
            store.record_subnet("r1", 0, &subnet).await.unwrap()
        );
    }

    #[tokio::test]
    async fn lock_create_is_conditional_until_expiry() {
        let store = InMemoryRecordStore::default();
        let live: u64 = time::now_epoch() + 60;

        assert_eq!(
            LockAttempt::Acquired,
            store.acquire_lock("lock#alice#k1", "r1", live).await.unwrap()
        );
        assert_eq!(
            LockAttempt::Held {
                target_request_id: "r1".to_string()
            },
            store.acquire_lock("lock#alice#k1", "r2", live).await.unwrap()
        );
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let store = InMemoryRecordStore::default();

        store
            .acquire_lock("lock#alice#k1", "r1", time::now_epoch())
            .await
            .unwrap();

        let attempt = store
            .acquire_lock("lock#alice#k1", "r2", time::now_epoch() + 60)
            .await
            .unwrap();
        assert_eq!(LockAttempt::Acquired, attempt);
    }

    #[tokio::test]
    async fn listing_pages_through_a_callers_requests() {
        let store = InMemoryRecordStore::default();

        for i in 0..5 {
            store
                .create_request(&request(&format!("r{i}"), "alice"))
                .await
                .unwrap();
        }
        store.create_request(&request("other", "bob")).await.unwrap();

        let mut seen: Vec<String> = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = store
                .list_requests("alice", 2, token.as_deref())
                .await
                .unwrap();
            seen.extend(page.items.into_iter().map(|r| r.request_id));

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        seen.sort();
        assert_eq!(vec!["r0", "r1", "r2", "r3", "r4"], seen);
    }

    #[tokio::test]
    async fn unknown_continuation_token_is_rejected() {
        let store = InMemoryRecordStore::default();
        store.create_request(&request("r1", "alice")).await.unwrap();

        let err = store
            .list_requests("alice", 2, Some("bogus-token"))
            .await
            .unwrap_err();

        assert!(matches!(err.reason, BadRecord(_)));
    }
}
