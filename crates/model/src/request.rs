use crate::spec::NetworkRequestSpec;
use crate::status::RequestStatus;
use crate::time;
use serde::{Deserialize, Serialize};

/// Record type marker for provisioning requests.
pub const REQUEST_RECORD_TYPE: &'static str = "VPC_REQUEST";
/// Record type marker for idempotency locks.
pub const LOCK_RECORD_TYPE: &'static str = "IDEMPOTENCY_LOCK";

/// A provisioning request record.
///
/// Created once by the submission side at `QUEUED` and mutated only by
/// the executor afterwards. `result` is filled in checkpoint by
/// checkpoint as provider calls succeed, so a partially provisioned
/// request is visible to readers before it completes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProvisioningRequest {
    pub request_id: String,
    pub record_type: String,
    pub created_by: String,
    pub idempotency_key: String,
    pub created_at: String,
    pub updated_at: String,
    pub ttl_epoch: u64,
    pub status: RequestStatus,
    pub spec: NetworkRequestSpec,
    #[serde(default)]
    pub result: ProvisioningResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProvisioningRequest {
    pub fn new(
        request_id: String,
        created_by: String,
        idempotency_key: String,
        spec: NetworkRequestSpec,
        ttl_epoch: u64,
    ) -> Self {
        let now: String = time::now_iso();

        ProvisioningRequest {
            request_id,
            record_type: REQUEST_RECORD_TYPE.to_string(),
            created_by,
            idempotency_key,
            created_at: now.clone(),
            updated_at: now,
            ttl_epoch,
            status: RequestStatus::Queued,
            spec,
            result: ProvisioningResult::default(),
            error_message: None,
        }
    }
}

/// Provider-assigned identifiers, written as each creation call is
/// confirmed.
///
/// `subnets` holds a strictly ordered prefix of the requested indices:
/// entry `i` exists only once the provider call for requested subnet
/// `i` succeeded and was checkpointed.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ProvisioningResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_cidr: Option<String>,
    #[serde(default)]
    pub subnets: Vec<CreatedSubnet>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CreatedNetwork {
    pub network_id: String,
    pub network_cidr: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CreatedSubnet {
    pub subnet_id: String,
    pub cidr: String,
    pub az: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An idempotency lock record, stored in the same namespace as the
/// requests under a `lock#<caller>#<key>` key.
///
/// Deliberately carries no `created_by` attribute so per-caller list
/// queries never surface it. Never updated; it expires via TTL.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdempotencyLock {
    /// The lock key, occupying the same key attribute as request ids.
    pub request_id: String,
    pub record_type: String,
    pub target_request_id: String,
    pub ttl_epoch: u64,
    pub created_at: String,
}

impl IdempotencyLock {
    pub fn new(lock_key: String, target_request_id: String, ttl_epoch: u64) -> Self {
        IdempotencyLock {
            request_id: lock_key,
            record_type: LOCK_RECORD_TYPE.to_string(),
            target_request_id,
            ttl_epoch,
            created_at: time::now_iso(),
        }
    }
}
