use async_trait::async_trait;
use aws_sdk_ec2::config::http::HttpResponse;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{ResourceType, Tag as Ec2Tag, TagSpecification, VpcState};
use provider::{NetworkProvider, ProviderError, Tag};
use std::time::{Duration, Instant};

/// How long to wait for a created VPC to become available.
const VPC_AVAILABLE_TIMEOUT: Duration = Duration::from_secs(30);
const VPC_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Provider error codes that retrying cannot fix.
const TERMINAL_ERROR_CODES: &[&str] = &[
    "VpcLimitExceeded",
    "SubnetLimitExceeded",
    "InvalidParameterValue",
    "InvalidVpc.Range",
    "InvalidSubnet.Conflict",
    "InvalidSubnet.Range",
    "InvalidVpcID.NotFound",
    "UnauthorizedOperation",
];

/// EC2-backed [`NetworkProvider`].
///
/// Creations are tagged inline so no resource ever exists untagged.
/// Callers are expected to configure a bounded operation timeout on
/// the client; the availability wait is additionally bounded here.
pub struct Ec2NetworkProvider {
    ec2_client: aws_sdk_ec2::Client,
}

impl Ec2NetworkProvider {
    pub fn new(ec2_client: aws_sdk_ec2::Client) -> Self {
        Ec2NetworkProvider { ec2_client }
    }

    /// Poll until the VPC reports available. Best effort: a VPC still
    /// pending after the bound is left for subnet creation to retry
    /// against, matching the original worker.
    async fn wait_until_available(&self, network_id: &str) {
        let started: Instant = Instant::now();

        while started.elapsed() < VPC_AVAILABLE_TIMEOUT {
            let state: Option<VpcState> = self
                .ec2_client
                .describe_vpcs()
                .vpc_ids(network_id)
                .send()
                .await
                .ok()
                .and_then(|output| output.vpcs.unwrap_or_default().into_iter().next())
                .and_then(|vpc| vpc.state);

            if matches!(state, Some(VpcState::Available)) {
                return;
            }

            tokio::time::sleep(VPC_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl NetworkProvider for Ec2NetworkProvider {
    async fn create_network(&self, cidr: &str, tags: &[Tag]) -> Result<String, ProviderError> {
        let output = self
            .ec2_client
            .create_vpc()
            .cidr_block(cidr)
            .tag_specifications(tag_specification(ResourceType::Vpc, tags))
            .send()
            .await
            .map_err(classify)?;

        let network_id: String = output
            .vpc
            .and_then(|vpc| vpc.vpc_id)
            .ok_or_else(|| missing_field("VpcId"))?;

        self.wait_until_available(&network_id).await;

        Ok(network_id)
    }

    async fn create_subnet(
        &self,
        network_id: &str,
        cidr: &str,
        az: &str,
        tags: &[Tag],
    ) -> Result<String, ProviderError> {
        let output = self
            .ec2_client
            .create_subnet()
            .vpc_id(network_id)
            .cidr_block(cidr)
            .availability_zone(az)
            .tag_specifications(tag_specification(ResourceType::Subnet, tags))
            .send()
            .await
            .map_err(classify)?;

        output
            .subnet
            .and_then(|subnet| subnet.subnet_id)
            .ok_or_else(|| missing_field("SubnetId"))
    }
}

fn tag_specification(resource_type: ResourceType, tags: &[Tag]) -> TagSpecification {
    let ec2_tags: Vec<Ec2Tag> = tags
        .iter()
        .map(|tag| {
            Ec2Tag::builder()
                .key(tag.key.clone())
                .value(tag.value.clone())
                .build()
        })
        .collect();

    TagSpecification::builder()
        .resource_type(resource_type)
        .set_tags(Some(ec2_tags))
        .build()
}

fn is_terminal_code(code: &str) -> bool {
    TERMINAL_ERROR_CODES.contains(&code)
}

/// Sort a provider failure into retriable or terminal. Unrecognised
/// codes stay retriable; the queue's redelivery bound diverts anything
/// persistent to the dead-letter channel.
fn classify<E>(err: SdkError<E, HttpResponse>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code: Option<String> = err.code().map(str::to_string);

    match code {
        Some(code) if is_terminal_code(&code) => {
            let message: String = err
                .message()
                .unwrap_or("provider rejected the request")
                .to_string();

            ProviderError::Terminal(format!("{code}: {message}"))
        }
        _ => ProviderError::Transient(err.into()),
    }
}

fn missing_field(field: &str) -> ProviderError {
    ProviderError::Transient(format!("provider response missing {field}").into())
}
