use crate::executor::{Outcome, ProvisioningExecutor};
use aws_lambda_events::sqs::{BatchItemFailure, SqsBatchResponse, SqsMessageObj};
use lambda_runtime::tracing::instrument::Instrumented;
use lambda_runtime::tracing::{Instrument, Span};
use lambda_runtime::{tracing, Error, LambdaEvent};
use model::{ProvisionJob, ProvisionSqsEvent};
use state::StateError;

/// Drive the executor over an SQS batch of provisioning jobs.
///
/// Each message is processed concurrently under its own span. Messages
/// whose request reached a terminal state are acknowledged; messages
/// told to retry later, and messages whose processing errored, are
/// reported back as batch item failures so SQS redelivers only those.
pub async fn handle_sqs_batch(
    executor: &ProvisioningExecutor,
    event: LambdaEvent<ProvisionSqsEvent>,
) -> Result<SqsBatchResponse, Error> {
    let records: Vec<SqsMessageObj<ProvisionJob>> = event.payload.records;

    tracing::info!("Handling batch of [{}] from SQS", records.len());

    // Start a task for each SQS message
    let (ids, tasks): (Vec<String>, Vec<_>) = records
        .into_iter()
        .map(|message: SqsMessageObj<ProvisionJob>| {
            // We need to keep the message_id to report failures to SQS
            let message_id: String = message.message_id.unwrap_or_default();
            let job: ProvisionJob = message.body;

            let message_span: Span =
                tracing::span!(tracing::Level::INFO, "SQS Handler", message_id);

            let task: Instrumented<_> =
                async move { executor.process(&job.request_id).await }.instrument(message_span);

            (message_id, task)
        })
        .unzip();

    // Process all messages concurrently
    let results: Vec<Result<Outcome, StateError>> = futures::future::join_all(tasks).await;

    let batch_item_failures: Vec<BatchItemFailure> =
        collect_batch_failures(ids.into_iter().zip(results));

    Ok(SqsBatchResponse {
        batch_item_failures,
    })
}

fn collect_batch_failures(
    results: impl Iterator<Item = (String, Result<Outcome, StateError>)>,
) -> Vec<BatchItemFailure> {
    results
        .filter_map(
            // Keep message ids whose request still has work left
            |(message_id, result): (String, Result<Outcome, StateError>)| match result {
                Ok(Outcome::Completed) | Ok(Outcome::Failed) => None,
                Ok(Outcome::RetryLater) => {
                    tracing::info!("Msg {message_id} will be redelivered");

                    Some(message_id)
                }
                Err(err) => {
                    tracing::error!("Failed to process msg {message_id}, {err}");

                    Some(message_id)
                }
            },
        )
        .map(|id| BatchItemFailure {
            item_identifier: id,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_lambda_events::sqs::SqsEventObj;
    use lambda_runtime::Context;
    use state::RecordStore;
    use state_in_memory::InMemoryRecordStore;
    use std::sync::Arc;
    use test_utils::{queued_request, sqs_message_with_body, two_subnet_spec, FakeFailure, FakeProvider};

    fn event(messages: Vec<SqsMessageObj<ProvisionJob>>) -> LambdaEvent<ProvisionSqsEvent> {
        LambdaEvent::new(SqsEventObj { records: messages }, Context::default())
    }

    fn job(request_id: &str) -> ProvisionJob {
        ProvisionJob {
            request_id: request_id.to_string(),
        }
    }

    #[tokio::test]
    async fn completed_and_failed_requests_are_acknowledged() {
        let store = Arc::new(InMemoryRecordStore::default());
        let provider = Arc::new(FakeProvider::default());
        provider.fail_network_at_call(2, FakeFailure::Terminal("quota".to_string()));

        store.create_request(&queued_request("r-ok", "alice")).await.unwrap();
        store.create_request(&queued_request("r-bad", "alice")).await.unwrap();

        let executor = ProvisioningExecutor::new(store, provider);
        let response = handle_sqs_batch(
            &executor,
            event(vec![sqs_message_with_body("m-1", job("r-ok"))]),
        )
        .await
        .unwrap();
        assert!(response.batch_item_failures.is_empty());

        // A terminally failed request is still done from SQS's view
        let response = handle_sqs_batch(
            &executor,
            event(vec![sqs_message_with_body("m-2", job("r-bad"))]),
        )
        .await
        .unwrap();
        assert!(response.batch_item_failures.is_empty());
    }

    #[tokio::test]
    async fn only_the_retrying_message_is_reported_as_failed() {
        let store = Arc::new(InMemoryRecordStore::default());
        let provider = Arc::new(FakeProvider::default());
        // Second network call (r-retry) hits a transient provider error
        provider.fail_network_at_call(2, FakeFailure::Transient);

        store.create_request(&queued_request("r-done", "alice")).await.unwrap();
        store.create_request(&queued_request("r-retry", "alice")).await.unwrap();

        let executor = ProvisioningExecutor::new(store, provider);
        let response = handle_sqs_batch(
            &executor,
            event(vec![
                sqs_message_with_body("m-1", job("r-done")),
                sqs_message_with_body("m-2", job("r-retry")),
            ]),
        )
        .await
        .unwrap();

        let failed: Vec<&str> = response
            .batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
            .collect();
        assert_eq!(vec!["m-2"], failed);
    }

    #[tokio::test]
    async fn unknown_request_ids_are_redelivered() {
        let store = Arc::new(InMemoryRecordStore::default());
        let executor = ProvisioningExecutor::new(store, Arc::new(FakeProvider::default()));

        let response = handle_sqs_batch(
            &executor,
            event(vec![sqs_message_with_body("m-1", job("r-missing"))]),
        )
        .await
        .unwrap();

        assert_eq!(1, response.batch_item_failures.len());
        assert_eq!("m-1", response.batch_item_failures[0].item_identifier);
    }

    #[tokio::test]
    async fn spec_sizes_drive_the_subnet_fan_out() {
        let store = Arc::new(InMemoryRecordStore::default());
        let provider = Arc::new(FakeProvider::default());

        store.create_request(&queued_request("r-1", "alice")).await.unwrap();

        let executor = ProvisioningExecutor::new(store, provider.clone());
        handle_sqs_batch(
            &executor,
            event(vec![sqs_message_with_body("m-1", job("r-1"))]),
        )
        .await
        .unwrap();

        assert_eq!(two_subnet_spec().subnets.len(), provider.subnet_call_count());
    }
}
