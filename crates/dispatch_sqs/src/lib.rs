use async_trait::async_trait;
use dispatch::JobDispatcher;
use model::{Error, ProvisionJob};

/// Dispatches job notifications onto the provisioning SQS queue.
///
/// Redelivery bounds and dead-letter diversion are queue
/// configuration, not code: the queue's redrive policy moves a
/// notification to the dead-letter channel after maxReceiveCount
/// deliveries.
pub struct SqsDispatcher {
    sqs_client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsDispatcher {
    pub fn new(sqs_client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        SqsDispatcher {
            sqs_client,
            queue_url,
        }
    }
}

#[async_trait]
impl JobDispatcher for SqsDispatcher {
    async fn dispatch(&self, job: &ProvisionJob) -> Result<(), Error> {
        self.sqs_client
            .send_message()
            .queue_url(self.queue_url.as_str())
            .message_body(serde_json::to_string(job)?)
            .send()
            .await?;

        Ok(())
    }
}
