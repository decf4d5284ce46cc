use aws_lambda_events::sqs::{SqsEventObj, SqsMessageObj};
use serde::{Deserialize, Serialize};

pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub mod env;
pub mod request;
pub mod spec;
pub mod status;
pub mod time;

/// Body of a queued job notification.
///
/// The request record is the source of truth; the notification only
/// names which request to (re)process, so redelivery is harmless.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProvisionJob {
    pub request_id: String,
}

pub type ProvisionSqsEvent = SqsEventObj<ProvisionJob>;
pub type ProvisionSqsMessage = SqsMessageObj<ProvisionJob>;
