use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use engine::{handle_sqs_batch, ProvisionLambdaEvent, ProvisioningExecutor};
use lambda_runtime::{service_fn, tracing, Error};
use model::env;
use provider_ec2::Ec2NetworkProvider;
use state_dynamodb::DynamoDbRecordStore;
use std::sync::Arc;
use std::time::Duration;

/// Provider calls must finish well inside the Lambda timeout so a
/// stalled call surfaces as a retriable error rather than a lost
/// invocation.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(45);

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::init_default_subscriber();

    let table_name: String = std::env::var(env::TABLE_NAME)?;

    let config: SdkConfig = aws_config::defaults(BehaviorVersion::latest())
        .timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(OPERATION_TIMEOUT)
                .build(),
        )
        .load()
        .await;

    let executor: ProvisioningExecutor = ProvisioningExecutor::new(
        Arc::new(DynamoDbRecordStore::new(
            aws_sdk_dynamodb::Client::new(&config),
            table_name,
        )),
        Arc::new(Ec2NetworkProvider::new(aws_sdk_ec2::Client::new(&config))),
    );

    lambda_runtime::run(service_fn(|event: ProvisionLambdaEvent| {
        handle_sqs_batch(&executor, event)
    }))
    .await
}
