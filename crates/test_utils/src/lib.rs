use async_trait::async_trait;
use aws_lambda_events::sqs::SqsMessageObj;
use model::request::ProvisioningRequest;
use model::spec::{NetworkRequestSpec, NetworkSpec, SubnetSpec};
use model::time;
use provider::{NetworkProvider, ProviderError, Tag};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Create a dummy SQS message with a set id and body
pub fn sqs_message_with_body<T>(message_id: &str, body: T) -> SqsMessageObj<T>
where
    T: Serialize + Clone,
{
    SqsMessageObj {
        message_id: Some(message_id.to_string()),
        receipt_handle: None,
        body,
        md5_of_body: None,
        md5_of_message_attributes: None,
        attributes: Default::default(),
        message_attributes: Default::default(),
        event_source_arn: None,
        event_source: None,
        aws_region: None,
    }
}

/// The concrete scenario spec: one /16 network with two /24 subnets.
pub fn two_subnet_spec() -> NetworkRequestSpec {
    NetworkRequestSpec {
        network: NetworkSpec {
            cidr: "10.0.0.0/16".to_string(),
        },
        subnets: vec![
            SubnetSpec {
                cidr: "10.0.1.0/24".to_string(),
                az: "eu-west-1a".to_string(),
                name: None,
            },
            SubnetSpec {
                cidr: "10.0.2.0/24".to_string(),
                az: "eu-west-1b".to_string(),
                name: Some("private-b".to_string()),
            },
        ],
    }
}

/// A freshly queued request record for the two-subnet scenario.
pub fn queued_request(request_id: &str, created_by: &str) -> ProvisioningRequest {
    ProvisioningRequest::new(
        request_id.to_string(),
        created_by.to_string(),
        "k1".to_string(),
        two_subnet_spec(),
        time::now_epoch() + 24 * 60 * 60,
    )
}

/// A scripted failure for [`FakeProvider`], keyed by call ordinal.
pub enum FakeFailure {
    Transient,
    Terminal(String),
}

impl FakeFailure {
    fn into_error(self) -> ProviderError {
        match self {
            FakeFailure::Transient => {
                ProviderError::Transient("simulated transient failure".into())
            }
            FakeFailure::Terminal(reason) => ProviderError::Terminal(reason),
        }
    }
}

/// An in-memory [`NetworkProvider`] which counts every creation call,
/// for asserting that re-execution never re-creates a checkpointed
/// resource.
#[derive(Default)]
pub struct FakeProvider {
    inner: Mutex<FakeProviderInner>,
}

#[derive(Default)]
struct FakeProviderInner {
    network_calls: usize,
    subnet_calls: Vec<(String, String)>,
    next_id: usize,
    network_failures: HashMap<usize, FakeFailure>,
    subnet_failures: HashMap<usize, FakeFailure>,
}

impl FakeProvider {
    /// Script the nth network creation call (1-based) to fail.
    pub fn fail_network_at_call(&self, call: usize, failure: FakeFailure) {
        self.inner.lock().unwrap().network_failures.insert(call, failure);
    }

    /// Script the nth subnet creation call (1-based) to fail.
    pub fn fail_subnet_at_call(&self, call: usize, failure: FakeFailure) {
        self.inner.lock().unwrap().subnet_failures.insert(call, failure);
    }

    pub fn network_call_count(&self) -> usize {
        self.inner.lock().unwrap().network_calls
    }

    pub fn subnet_call_count(&self) -> usize {
        self.inner.lock().unwrap().subnet_calls.len()
    }

    /// The (cidr, az) pairs of every subnet creation call, in order.
    pub fn subnet_calls(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().subnet_calls.clone()
    }
}

#[async_trait]
impl NetworkProvider for FakeProvider {
    async fn create_network(&self, _cidr: &str, _tags: &[Tag]) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.network_calls += 1;

        let call: usize = inner.network_calls;
        if let Some(failure) = inner.network_failures.remove(&call) {
            return Err(failure.into_error());
        }

        inner.next_id += 1;
        Ok(format!("vpc-{:04}", inner.next_id))
    }

    async fn create_subnet(
        &self,
        _network_id: &str,
        cidr: &str,
        az: &str,
        _tags: &[Tag],
    ) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.subnet_calls.push((cidr.to_string(), az.to_string()));

        let call: usize = inner.subnet_calls.len();
        if let Some(failure) = inner.subnet_failures.remove(&call) {
            return Err(failure.into_error());
        }

        inner.next_id += 1;
        Ok(format!("subnet-{:04}", inner.next_id))
    }
}
