use std::{collections::HashSet, time::Duration};

use futures_util::{future::BoxFuture, stream::FuturesUnordered, FutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    llm::Executor,
    models::{DispatchSettings, GenerationParameters, OutcomeStatus, ProviderConfig, RequestOutcome},
    telemetry,
};

/**
 * \brief A dispatched set of provider tasks that have not been awaited yet.
 * \details Every task resolves to exactly one terminal `RequestOutcome`.
 */
pub struct Batch {
    pub(crate) tasks: FuturesUnordered<BoxFuture<'static, RequestOutcome>>,
    pub(crate) total: usize,
    cancel: CancellationToken,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /**
     * \brief Token that stops further HTTP attempts for every unfinished task.
     */
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/**
 * \brief Schedules one executor run per provider, staggered by list position.
 */
#[derive(Clone)]
pub struct Dispatcher {
    executor: Executor,
}

impl Dispatcher {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    /**
     * \brief Creates the batch without blocking.
     * \details Provider `i` starts no earlier than `i * delay_step` after this call,
     * regardless of when the batch is first polled.
     */
    pub fn dispatch(
        &self,
        prompt: &str,
        providers: &[ProviderConfig],
        params: &GenerationParameters,
        settings: &DispatchSettings,
    ) -> Batch {
        let batch_start = Instant::now();
        let cancel = CancellationToken::new();
        let timeout = settings.timeout();
        let tasks = FuturesUnordered::new();

        for (index, provider) in providers.iter().enumerate() {
            let delay = settings.delay_for(index);
            let executor = self.executor.clone();
            let provider = provider.clone();
            let prompt = prompt.to_string();
            let params = *params;
            let cancel = cancel.clone();
            tasks.push(
                async move {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return RequestOutcome::new(
                                    &provider.name,
                                    "Request cancelled",
                                    OutcomeStatus::Cancelled,
                                    Duration::ZERO,
                                );
                            }
                            _ = tokio::time::sleep_until(batch_start + delay) => {}
                        }
                    }
                    executor
                        .execute_provider(&provider, &prompt, timeout, &params, &cancel)
                        .await
                }
                .boxed(),
            );
        }

        telemetry::log_event(
            "dispatch",
            &format!(
                "batch of {} providers, delay_step={}s timeout={:.1}s prompt_len={}",
                providers.len(),
                settings.delay_step_seconds,
                timeout.as_secs_f64(),
                prompt.len()
            ),
        );

        Batch {
            total: tasks.len(),
            tasks,
            cancel,
        }
    }

    /**
     * \brief Re-dispatches only the providers whose previous outcome is an error.
     */
    pub fn retry_failed(
        &self,
        prompt: &str,
        previous: &[RequestOutcome],
        providers: &[ProviderConfig],
        params: &GenerationParameters,
        settings: &DispatchSettings,
    ) -> Batch {
        let selected = failed_providers(previous, providers);
        telemetry::log_event(
            "dispatch",
            &format!("retrying {} failed providers", selected.len()),
        );
        self.dispatch(prompt, &selected, params, settings)
    }
}

/**
 * \brief Providers whose last outcome is an error, kept in `providers` order.
 */
pub fn failed_providers(
    previous: &[RequestOutcome],
    providers: &[ProviderConfig],
) -> Vec<ProviderConfig> {
    let failed: HashSet<&str> = previous
        .iter()
        .filter(|o| o.is_error())
        .map(|o| o.provider_name.as_str())
        .collect();
    providers
        .iter()
        .filter(|p| failed.contains(p.name.as_str()))
        .cloned()
        .collect()
}
