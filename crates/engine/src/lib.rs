use aws_lambda_events::sqs::SqsBatchResponse;
use lambda_runtime::LambdaEvent;
use model::ProvisionSqsEvent;

mod batch_handler;
pub mod executor;
pub mod submission;

pub use batch_handler::handle_sqs_batch;
pub use executor::{Outcome, ProvisioningExecutor};
pub use submission::{Submission, SubmissionService, SubmitError};

pub type ProvisionLambdaEvent = LambdaEvent<ProvisionSqsEvent>;
pub type ProvisionBatchResponse = SqsBatchResponse;
