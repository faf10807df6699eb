//! Transactional outbox messaging.
//!
//! Messages published alongside a local data change are recorded in a
//! [`store::MessageStore`] first and handed to a [`queue::TransportQueue`]
//! only once that change has committed. A [`dispatcher::Dispatcher`] delivers
//! them at least once to the handlers subscribed to their (name, group) pair,
//! retrying failures with backoff until they succeed or are declared dead.
//!
//! [`Relay`] wires everything together from a [`Config`].

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod id;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod reaper;
pub mod relay;
pub mod store;
pub mod transaction;

pub use config::Config;
pub use dispatcher::{DispatchEvent, Dispatcher, Handler, RetryPolicy};
pub use error::Error;
pub use message::{Message, MessageKind, MessageStatus};
pub use publisher::Publisher;
pub use relay::Relay;
pub use transaction::{Scope, SharedTransaction, Transaction};

/// Installs the global tracing subscriber, filtered by `OUTPOST_LOG`.
///
/// Pretty output in debug builds, JSON otherwise.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("OUTPOST_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
