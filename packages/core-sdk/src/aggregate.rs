use async_stream::stream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{dispatch::Batch, models::RequestOutcome, telemetry};

/**
 * \brief One arrival, with the running snapshot after it.
 */
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub outcome: RequestOutcome,
    pub completed: usize,
    pub total: usize,
    /** \brief Outcomes so far, in arrival order. Never shrinks or reorders. */
    pub snapshot: Vec<RequestOutcome>,
}

/**
 * \brief Consumes a `Batch` in completion order.
 */
pub struct Aggregator {
    batch: Batch,
    completed: Vec<RequestOutcome>,
}

impl Aggregator {
    pub fn new(batch: Batch) -> Self {
        let total = batch.total;
        Self {
            batch,
            completed: Vec::with_capacity(total),
        }
    }

    pub fn total(&self) -> usize {
        self.batch.total
    }

    pub fn is_finished(&self) -> bool {
        self.completed.len() == self.batch.total
    }

    pub fn snapshot(&self) -> &[RequestOutcome] {
        &self.completed
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.batch.cancel_token()
    }

    /**
     * \brief Waits for the next task to finish; `None` once all have.
     */
    pub async fn next(&mut self) -> Option<&RequestOutcome> {
        let outcome = self.batch.tasks.next().await?;
        telemetry::log_event(
            "aggregate",
            &format!(
                "{} -> {} in {:.2}s ({}/{})",
                outcome.provider_name,
                outcome.status,
                outcome.elapsed_seconds,
                self.completed.len() + 1,
                self.batch.total
            ),
        );
        self.completed.push(outcome);
        self.completed.last()
    }

    /**
     * \brief Drains the remaining tasks and returns every outcome in arrival order.
     */
    pub async fn finish(mut self) -> Vec<RequestOutcome> {
        while self.next().await.is_some() {}
        self.completed
    }

    /**
     * \brief Streams one `Progress` per arrival. Dropping the stream cancels the batch.
     */
    pub fn into_stream(mut self) -> impl Stream<Item = Progress> + Send {
        let guard = self.batch.cancel_token().drop_guard();
        stream! {
            let _guard = guard;
            let total = self.batch.total;
            while let Some(outcome) = self.next().await.cloned() {
                yield Progress {
                    outcome,
                    completed: self.completed.len(),
                    total,
                    snapshot: self.completed.clone(),
                };
            }
        }
    }
}

/**
 * \brief Replaces held outcomes by provider name with retried ones.
 * \details Untouched rows keep their position; unknown providers are appended.
 */
pub fn merge_outcomes(held: &mut Vec<RequestOutcome>, fresh: Vec<RequestOutcome>) {
    for outcome in fresh {
        match held
            .iter_mut()
            .find(|o| o.provider_name == outcome.provider_name)
        {
            Some(slot) => *slot = outcome,
            None => held.push(outcome),
        }
    }
}
