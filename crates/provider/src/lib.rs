use async_trait::async_trait;
use model::Error;
use std::fmt::{Display, Formatter};

/// The fixed labels applied to everything this system creates.
pub const PROJECT_TAG_KEY: &str = "Project";
pub const NAME_TAG_KEY: &str = "Name";
pub const PROJECT_LABEL: &str = "demo";
/// Traceability label carrying the request id.
pub const REQUEST_ID_TAG_KEY: &str = "RequestId";
/// Optional label carrying the caller-supplied subnet name.
pub const SUBNET_NAME_TAG_KEY: &str = "SubnetName";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Self {
        Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

fn fixed_tags(request_id: &str) -> Vec<Tag> {
    vec![
        Tag::new(NAME_TAG_KEY, PROJECT_LABEL),
        Tag::new(PROJECT_TAG_KEY, PROJECT_LABEL),
        Tag::new(REQUEST_ID_TAG_KEY, request_id),
    ]
}

/// Tags for the network itself.
pub fn network_tags(request_id: &str) -> Vec<Tag> {
    fixed_tags(request_id)
}

/// Tags for one subnet; carries the caller-supplied name when present.
pub fn subnet_tags(request_id: &str, name: Option<&str>) -> Vec<Tag> {
    let mut tags: Vec<Tag> = fixed_tags(request_id);

    if let Some(name) = name {
        tags.push(Tag::new(SUBNET_NAME_TAG_KEY, name));
    }

    tags
}

/// Failures from the external resource provider, classified by whether
/// a redelivered job may succeed.
#[derive(Debug)]
pub enum ProviderError {
    // Throttling, timeouts, 5xx; the job should be retried later
    Transient(Error),
    // Quota exhaustion and rejections; retrying cannot succeed
    Terminal(String),
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Transient(err) => write!(f, "transient provider failure: {err}"),
            ProviderError::Terminal(reason) => write!(f, "terminal provider failure: {reason}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// The external resource provider capability: create a network, create
/// a sub-network. Neither call is assumed idempotent, which is why the
/// executor checkpoints every confirmed identifier before proceeding.
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    async fn create_network(&self, cidr: &str, tags: &[Tag]) -> Result<String, ProviderError>;

    async fn create_subnet(
        &self,
        network_id: &str,
        cidr: &str,
        az: &str,
        tags: &[Tag],
    ) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_tags_carry_the_request_id() {
        let tags = network_tags("r1");

        assert!(tags.contains(&Tag::new(REQUEST_ID_TAG_KEY, "r1")));
        assert!(tags.contains(&Tag::new(PROJECT_TAG_KEY, PROJECT_LABEL)));
    }

    #[test]
    fn subnet_name_label_is_applied_only_when_supplied() {
        let unnamed = subnet_tags("r1", None);
        let named = subnet_tags("r1", Some("private-a"));

        assert!(!unnamed.iter().any(|t| t.key == SUBNET_NAME_TAG_KEY));
        assert!(named.contains(&Tag::new(SUBNET_NAME_TAG_KEY, "private-a")));
    }
}
