//! Submits download jobs to the queue.

use std::sync::Arc;

use crate::error::QueueError;
use crate::jobs::model::{DownloadPayload, JobId, JobOptions};
use crate::queue::JobQueue;

/// Thin front end over [`JobQueue::enqueue`].
#[derive(Clone)]
pub struct JobProducer {
    queue: Arc<dyn JobQueue>,
    defaults: JobOptions,
}

impl JobProducer {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            defaults: JobOptions::default(),
        }
    }

    /// Options used for any field the caller leaves unset.
    pub fn with_defaults(mut self, defaults: JobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub async fn enqueue(
        &self,
        file_ids: Vec<String>,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let options = JobOptions {
            attempts: options.attempts.or(self.defaults.attempts),
            backoff: options.backoff.or(self.defaults.backoff),
        };
        let payload = DownloadPayload { file_ids };
        let id = self.queue.enqueue(payload.to_value(), &options).await?;
        tracing::info!(
            job_id = %id,
            files = payload.file_ids.len(),
            max_attempts = options.max_attempts(),
            "Enqueued download job"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::model::Backoff;
    use crate::queue::MemoryQueue;

    #[tokio::test]
    async fn enqueue_serializes_file_ids() {
        let queue = Arc::new(MemoryQueue::new());
        let producer = JobProducer::new(queue.clone());

        let id = producer
            .enqueue(vec!["a".into(), "b".into()], JobOptions::default())
            .await
            .unwrap();
        let job = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.data, serde_json::json!({"fileIds": ["a", "b"]}));
        assert_eq!(job.max_attempts, 1);
    }

    #[tokio::test]
    async fn defaults_fill_unset_options() {
        let queue = Arc::new(MemoryQueue::new());
        let producer = JobProducer::new(queue.clone()).with_defaults(
            JobOptions::default()
                .with_attempts(3)
                .with_backoff(Backoff::Fixed { delay: 10 }),
        );

        producer
            .enqueue(vec!["a".into()], JobOptions::default())
            .await
            .unwrap();
        producer
            .enqueue(vec!["b".into()], JobOptions::default().with_attempts(5))
            .await
            .unwrap();

        let first = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first.max_attempts, 3);
        assert_eq!(second.max_attempts, 5);
    }
}
