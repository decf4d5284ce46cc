use async_trait::async_trait;
use aws_sdk_dynamodb::config::http::HttpResponse;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::get_item::{GetItemError, GetItemOutput};
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::AttributeValue;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use model::request::{
    CreatedNetwork, CreatedSubnet, IdempotencyLock, ProvisioningRequest, REQUEST_RECORD_TYPE,
};
use model::status::RequestStatus;
use model::time;
use state::StateErrorReason::{BackendFailure, BadRecord, MissingEntry};
use state::StateOperation::{
    AcquireLock, CreateRequest, GetRequest, ListRequests, RecordNetwork, RecordSubnet,
    TransitionStatus,
};
use state::{
    Checkpoint, LockAttempt, RecordStore, RequestPage, StateError, StateOperation, Transition,
};
use std::collections::HashMap;

const KEY_ATTRIBUTE: &str = "request_id";
const TARGET_REQUEST_ID: &str = "target_request_id";
const RECORD_TYPE: &str = "record_type";

/// Name of the secondary index ordering requests by creation time per
/// caller. Lock records carry no `created_by` attribute and therefore
/// never appear in it.
pub const CREATED_BY_INDEX: &str = "created_by_index";

/// DynamoDB-backed [`RecordStore`].
///
/// Requests and idempotency locks share one table keyed by
/// `request_id`; lock records occupy `lock#<caller>#<key>` keys.
/// Every mutation is expressed as a conditional expression so lost
/// races surface as `ConditionalCheckFailedException`, which the
/// methods translate into [`Transition::Lost`] and friends.
pub struct DynamoDbRecordStore {
    table_name: String,
    index_name: String,
    dynamodb_client: aws_sdk_dynamodb::Client,
    consistent_read: bool,
}

impl DynamoDbRecordStore {
    pub fn new(dynamodb_client: aws_sdk_dynamodb::Client, table_name: String) -> Self {
        DynamoDbRecordStore {
            table_name,
            index_name: CREATED_BY_INDEX.to_string(),
            dynamodb_client,
            consistent_read: true,
        }
    }

    pub fn index_name(mut self, index_name: String) -> Self {
        self.index_name = index_name;
        self
    }

    pub fn consistent_read(mut self, consistent_read: bool) -> Self {
        self.consistent_read = consistent_read;
        self
    }
}

#[async_trait]
impl RecordStore for DynamoDbRecordStore {
    async fn create_request(&self, request: &ProvisioningRequest) -> Result<(), StateError> {
        let item: HashMap<String, AttributeValue> = serde_dynamo::to_item(request)
            .map_err(|err| bad_record(&request.request_id, CreateRequest, err.to_string()))?;

        self.dynamodb_client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(request_id)")
            .send()
            .await
            .map_err(|err| {
                if is_condition_failure_put(&err) {
                    bad_record(
                        &request.request_id,
                        CreateRequest,
                        "request already exists".to_string(),
                    )
                } else {
                    backend(&request.request_id, CreateRequest, err.into())
                }
            })?;

        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> Result<ProvisioningRequest, StateError> {
        let output: GetItemOutput = self
            .get_item(request_id)
            .await
            .map_err(|err| backend(request_id, GetRequest, err.into()))?;

        let item: HashMap<String, AttributeValue> = output
            .item
            .ok_or_else(|| StateError::new(request_id.to_string(), GetRequest, MissingEntry))?;

        // Lock records resolve under the same key space but are never
        // surfaced as requests
        match item.get(RECORD_TYPE) {
            Some(AttributeValue::S(kind)) if kind == REQUEST_RECORD_TYPE => {}
            _ => return Err(StateError::new(request_id.to_string(), GetRequest, MissingEntry)),
        }

        serde_dynamo::from_item(item)
            .map_err(|err| bad_record(request_id, GetRequest, err.to_string()))
    }

    async fn transition_status(
        &self,
        request_id: &str,
        from: RequestStatus,
        to: RequestStatus,
        error_message: Option<&str>,
    ) -> Result<Transition, StateError> {
        if !from.can_transition_to(to) {
            return Err(bad_record(
                request_id,
                TransitionStatus,
                format!("illegal transition {from} -> {to}"),
            ));
        }

        let update_expression: &str = match error_message {
            Some(_) => "SET #s = :to, updated_at = :u, error_message = :e",
            None => "SET #s = :to, updated_at = :u",
        };

        let mut update = self
            .dynamodb_client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY_ATTRIBUTE, AttributeValue::S(request_id.to_string()))
            .update_expression(update_expression)
            .condition_expression("#s = :from")
            .expression_attribute_names("#s", "status")
            .expression_attribute_values(":to", AttributeValue::S(to.as_str().to_string()))
            .expression_attribute_values(":from", AttributeValue::S(from.as_str().to_string()))
            .expression_attribute_values(":u", AttributeValue::S(time::now_iso()));

        if let Some(message) = error_message {
            update = update.expression_attribute_values(":e", AttributeValue::S(message.to_string()));
        }

        match update.send().await {
            Ok(_) => Ok(Transition::Applied),
            Err(err) if is_condition_failure_update(&err) => {
                // Lost the race; report whatever status won
                let current: ProvisioningRequest = self.get_request(request_id).await?;

                Ok(Transition::Lost {
                    current: current.status,
                })
            }
            Err(err) => Err(backend(request_id, TransitionStatus, err.into())),
        }
    }

    async fn record_network(
        &self,
        request_id: &str,
        network: &CreatedNetwork,
    ) -> Result<Checkpoint, StateError> {
        let result = self
            .dynamodb_client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY_ATTRIBUTE, AttributeValue::S(request_id.to_string()))
            .update_expression("SET #r.network_id = :nid, #r.network_cidr = :nc, updated_at = :u")
            .condition_expression("attribute_not_exists(#r.network_id)")
            .expression_attribute_names("#r", "result")
            .expression_attribute_values(":nid", AttributeValue::S(network.network_id.clone()))
            .expression_attribute_values(":nc", AttributeValue::S(network.network_cidr.clone()))
            .expression_attribute_values(":u", AttributeValue::S(time::now_iso()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(Checkpoint::Recorded),
            Err(err) if is_condition_failure_update(&err) => Ok(Checkpoint::AlreadyRecorded),
            Err(err) => Err(backend(request_id, RecordNetwork, err.into())),
        }
    }

    async fn record_subnet(
        &self,
        request_id: &str,
        index: usize,
        subnet: &CreatedSubnet,
    ) -> Result<Checkpoint, StateError> {
        let entry: AttributeValue = serde_dynamo::to_attribute_value(subnet)
            .map_err(|err| bad_record(request_id, RecordSubnet, err.to_string()))?;

        let result = self
            .dynamodb_client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY_ATTRIBUTE, AttributeValue::S(request_id.to_string()))
            .update_expression("SET #r.subnets = list_append(#r.subnets, :entry), updated_at = :u")
            .condition_expression("size(#r.subnets) = :index")
            .expression_attribute_names("#r", "result")
            .expression_attribute_values(":entry", AttributeValue::L(vec![entry]))
            .expression_attribute_values(":index", AttributeValue::N(index.to_string()))
            .expression_attribute_values(":u", AttributeValue::S(time::now_iso()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(Checkpoint::Recorded),
            Err(err) if is_condition_failure_update(&err) => Ok(Checkpoint::AlreadyRecorded),
            Err(err) => Err(backend(request_id, RecordSubnet, err.into())),
        }
    }

    async fn acquire_lock(
        &self,
        lock_key: &str,
        target_request_id: &str,
        ttl_epoch: u64,
    ) -> Result<LockAttempt, StateError> {
        let lock = IdempotencyLock::new(
            lock_key.to_string(),
            target_request_id.to_string(),
            ttl_epoch,
        );
        let item: HashMap<String, AttributeValue> = serde_dynamo::to_item(&lock)
            .map_err(|err| bad_record(lock_key, AcquireLock, err.to_string()))?;

        let result = self
            .dynamodb_client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            // An expired lock is as good as absent, even before the
            // TTL sweeper removes the item
            .condition_expression("attribute_not_exists(request_id) OR ttl_epoch <= :now")
            .expression_attribute_values(":now", AttributeValue::N(time::now_epoch().to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(LockAttempt::Acquired),
            Err(err) if is_condition_failure_put(&err) => {
                let output: GetItemOutput = self
                    .get_item(lock_key)
                    .await
                    .map_err(|err| backend(lock_key, AcquireLock, err.into()))?;

                let target: Option<String> = output.item.and_then(|item| {
                    item.get(TARGET_REQUEST_ID).and_then(|value| match value {
                        AttributeValue::S(id) => Some(id.clone()),
                        _ => None,
                    })
                });

                match target {
                    Some(target_request_id) => Ok(LockAttempt::Held { target_request_id }),
                    // The lock vanished between the put and the read;
                    // retriable from the caller's side
                    None => Err(backend(
                        lock_key,
                        AcquireLock,
                        "lock unreadable after conflict".into(),
                    )),
                }
            }
            Err(err) => Err(backend(lock_key, AcquireLock, err.into())),
        }
    }

    async fn list_requests(
        &self,
        created_by: &str,
        limit: usize,
        start_token: Option<&str>,
    ) -> Result<RequestPage, StateError> {
        let mut query = self
            .dynamodb_client
            .query()
            .table_name(&self.table_name)
            .index_name(&self.index_name)
            .key_condition_expression("created_by = :c")
            .expression_attribute_values(":c", AttributeValue::S(created_by.to_string()))
            .scan_index_forward(true)
            .limit(limit as i32);

        if let Some(token) = start_token {
            query = query.set_exclusive_start_key(Some(decode_next_token(created_by, token)?));
        }

        let output = query
            .send()
            .await
            .map_err(|err| backend(created_by, ListRequests, err.into()))?;

        let items: Vec<ProvisioningRequest> = output
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|item| {
                serde_dynamo::from_item(item)
                    .map_err(|err| bad_record(created_by, ListRequests, err.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let next_token: Option<String> = match output.last_evaluated_key {
            Some(key) => Some(encode_next_token(created_by, key)?),
            None => None,
        };

        Ok(RequestPage { items, next_token })
    }
}

impl DynamoDbRecordStore {
    async fn get_item(
        &self,
        key: &str,
    ) -> Result<GetItemOutput, SdkError<GetItemError, HttpResponse>> {
        self.dynamodb_client
            .get_item()
            .table_name(&self.table_name)
            .consistent_read(self.consistent_read)
            .key(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .send()
            .await
    }
}

fn is_condition_failure_put(err: &SdkError<PutItemError, HttpResponse>) -> bool {
    err.as_service_error()
        .is_some_and(|service_err| service_err.is_conditional_check_failed_exception())
}

fn is_condition_failure_update(err: &SdkError<UpdateItemError, HttpResponse>) -> bool {
    err.as_service_error()
        .is_some_and(|service_err| service_err.is_conditional_check_failed_exception())
}

fn bad_record(key: &str, operation: StateOperation, message: String) -> StateError {
    StateError::new(key.to_string(), operation, BadRecord(message))
}

fn backend(key: &str, operation: StateOperation, err: model::Error) -> StateError {
    StateError::new(key.to_string(), operation, BackendFailure(err))
}

/// The continuation token is the URL-safe base64 of the evaluated key,
/// opaque to callers (same scheme as the original gateway).
fn encode_next_token(
    created_by: &str,
    key: HashMap<String, AttributeValue>,
) -> Result<String, StateError> {
    let value: serde_json::Value = serde_dynamo::from_item(key)
        .map_err(|err| bad_record(created_by, ListRequests, err.to_string()))?;
    let raw: Vec<u8> = serde_json::to_vec(&value)
        .map_err(|err| bad_record(created_by, ListRequests, err.to_string()))?;

    Ok(URL_SAFE.encode(raw))
}

fn decode_next_token(
    created_by: &str,
    token: &str,
) -> Result<HashMap<String, AttributeValue>, StateError> {
    let invalid = |message: String| bad_record(created_by, ListRequests, message);

    let raw: Vec<u8> = URL_SAFE
        .decode(token)
        .map_err(|err| invalid(format!("invalid next_token: {err}")))?;
    let value: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|err| invalid(format!("invalid next_token: {err}")))?;

    serde_dynamo::to_item(value).map_err(|err| invalid(format!("invalid next_token: {err}")))
}
