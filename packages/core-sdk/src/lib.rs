pub mod aggregate;
pub mod credentials;
pub mod db;
pub mod dispatch;
pub mod llm;
pub mod models;
pub mod server;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

/**
 * \brief SDK prelude for front ends.
 */
pub mod prelude {
    pub use crate::aggregate::{merge_outcomes, Aggregator, Progress};
    pub use crate::dispatch::{Batch, Dispatcher};
    pub use crate::llm::Executor;
    pub use crate::models::{
        DispatchSettings, GenerationParameters, OutcomeStatus, ProviderConfig, RequestOutcome,
    };
    pub use crate::{db, server, telemetry};
}
