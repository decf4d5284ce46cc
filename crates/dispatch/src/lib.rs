use async_trait::async_trait;
use model::{Error, ProvisionJob};

/// Delivers job notifications to the worker queue.
///
/// Delivery downstream is at-least-once; the executor tolerates
/// duplicates, so implementations only need to get the notification
/// onto the channel once.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: &ProvisionJob) -> Result<(), Error>;
}

/// A dispatcher which always succeeds, for use in testing.
#[derive(Default)]
pub struct DummyDispatcher;

#[async_trait]
impl JobDispatcher for DummyDispatcher {
    async fn dispatch(&self, _job: &ProvisionJob) -> Result<(), Error> {
        Ok(())
    }
}
