//! Task submission

use std::sync::Arc;

use super::types::{Destination, SynthesisRequest, TaskId};
use crate::broker::TaskQueue;
use crate::voice::check_text_length;
use crate::{Error, Result};

/// Publishes synthesis requests without waiting for them
#[derive(Clone)]
pub struct TaskSubmitter {
    queue: Arc<dyn TaskQueue>,
    max_text_length: usize,
}

impl TaskSubmitter {
    #[must_use]
    pub fn new(queue: Arc<dyn TaskQueue>, max_text_length: usize) -> Self {
        Self {
            queue,
            max_text_length,
        }
    }

    /// Queue `text` for synthesis and playback on `destination`
    ///
    /// # Errors
    ///
    /// Returns `InputRejected` if the text is too long and
    /// `QueueUnavailable` if the queue cannot take the task. No task exists
    /// in either case.
    pub async fn submit(&self, text: &str, destination: Destination) -> Result<TaskId> {
        check_text_length(text, self.max_text_length)?;

        let request = SynthesisRequest::new(text, destination);
        self.queue.publish(&request).await.map_err(|e| match e {
            Error::QueueUnavailable(_) => e,
            other => Error::QueueUnavailable(other.to_string()),
        })?;

        tracing::debug!(
            task_id = %request.id,
            %destination,
            chars = text.chars().count(),
            "task submitted"
        );
        Ok(request.id)
    }
}

impl std::fmt::Debug for TaskSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSubmitter")
            .field("max_text_length", &self.max_text_length)
            .finish_non_exhaustive()
    }
}
