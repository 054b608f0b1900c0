//! # relayflow
//!
//! An event routing and workflow engine. Inputs (webhooks, UDP sockets, tailed files,
//! timers and the built-in loopback) produce canonical [`Event`]s; declarative
//! workflows filter, transform, enrich, aggregate and branch them; results are
//! published back onto the bus, and optionally re-injected as inputs.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────┐ emit ┌──────────┐ streams ┌──────────┐ on_output ┌──────────┐
//! │ inputs  │─────▶│ EventBus │────────▶│ workflow │──────────▶│ outputs  │
//! └─────────┘      └──────────┘         │  engine  │           └──────────┘
//!      ▲                                └────┬─────┘
//!      │              on_loopback            │ enrich / logic
//!      └─────────────────────────────────────┤
//!                                     ┌──────▼──────┐
//!                                     │ enrichment  │
//!                                     │  registry   │
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`event`]: the event model, topic buses and the push-stream operators
//! - [`input`]: input definitions, the runtime sources and the webhook route table
//! - [`enrichment`]: lookup providers behind a TTL cache with single-flight calls
//! - [`workflow`]: workflow definitions and the engine that runs them
//! - [`system`]: wires all of the above, with bounded histories and live updates
//!
//! Every registry is an owned value handed to its consumers, so tests build isolated
//! instances instead of sharing globals.

pub mod config;
pub mod enrichment;
pub mod error;
pub mod event;
pub mod history;
pub mod input;
pub mod system;
pub mod workflow;

pub(crate) mod guard;

// Re-exports
pub use config::SystemConfig;
pub use error::*;
pub use event::{Event, EventBus, EventStream, Subscription};
pub use history::EventHistory;
pub use system::{LiveUpdate, System};

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    }
}
