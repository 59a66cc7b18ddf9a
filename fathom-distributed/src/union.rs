//! Merged result stream of a fan-out.
//!
//! Shard tasks push blocks into one bounded channel. The consumer reads
//! them in arrival order. The first error:
//!
//! 1. broadcasts cancellation to every shard task,
//! 2. runs the error callback (at most once per stream),
//! 3. is yielded to the consumer, after which the stream ends.
//!
//! Dropping the stream also cancels the shard tasks.

use std::fmt;
use std::sync::Arc;

use fathom_core::{merge_partial_blocks, Block, SelectQuery};
use fathom_routing::ProcessingStage;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{DistError, DistResult};
use crate::stream::BlockStream;

/// Callback invoked with the first shard error, before it is yielded.
pub type ErrorCallback = Arc<dyn Fn(&DistError) -> BoxFuture<'static, ()> + Send + Sync>;

/// Union of the result streams of every shard.
pub struct MergedStream {
    stage: ProcessingStage,
    rx: mpsc::Receiver<DistResult<Block>>,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    on_error: Option<ErrorCallback>,
    final_merge: Option<SelectQuery>,
    error_fired: bool,
    done: bool,
}

impl fmt::Debug for MergedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedStream")
            .field("stage", &self.stage)
            .field("tasks", &self.tasks.len())
            .field("final_merge", &self.final_merge.is_some())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl MergedStream {
    pub(crate) fn new(
        stage: ProcessingStage,
        rx: mpsc::Receiver<DistResult<Block>>,
        cancel: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            stage,
            rx,
            cancel,
            tasks,
            on_error,
            final_merge: None,
            error_fired: false,
            done: false,
        }
    }

    /// Combines partial aggregation states into final rows before yielding.
    #[must_use]
    pub(crate) fn with_final_merge(mut self, query: SelectQuery) -> Self {
        self.final_merge = Some(query);
        self
    }

    /// Stage every shard processed the query to.
    #[must_use]
    pub const fn stage(&self) -> ProcessingStage {
        self.stage
    }

    /// Number of shard tasks feeding this stream.
    #[must_use]
    pub fn shard_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Returns the next block, or `None` once every shard finished or an
    /// error was yielded.
    pub async fn next(&mut self) -> Option<DistResult<Block>> {
        if self.done {
            return None;
        }
        let Some(query) = self.final_merge.take() else {
            return self.next_raw().await;
        };

        let mut partials = Vec::new();
        while let Some(item) = self.next_raw().await {
            match item {
                Ok(block) => partials.push(block),
                Err(e) => return Some(Err(e)),
            }
        }
        self.done = true;
        debug!(partials = partials.len(), "merging partial aggregation states");
        Some(merge_partial_blocks(&query, partials).map_err(DistError::from))
    }

    async fn next_raw(&mut self) -> Option<DistResult<Block>> {
        match self.rx.recv().await {
            Some(Ok(block)) => Some(Ok(block)),
            Some(Err(e)) => {
                self.done = true;
                self.cancel.send_replace(true);
                if !self.error_fired {
                    self.error_fired = true;
                    if let Some(callback) = &self.on_error {
                        callback(&e).await;
                    }
                }
                Some(Err(e))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Cancels every shard task and waits for them to stop.
    pub async fn close(mut self) {
        self.cancel.send_replace(true);
        for task in std::mem::take(&mut self.tasks) {
            // Shard tasks report their own failures through the channel.
            let _ = task.await;
        }
    }

    /// Converts into a boxed stream.
    #[must_use]
    pub fn into_stream(self) -> BlockStream {
        Box::pin(futures::stream::unfold(self, |mut merged| async move {
            merged.next().await.map(|item| (item, merged))
        }))
    }
}

impl Drop for MergedStream {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}
