//! # Event Routing
//!
//! Everything that moves an [`Event`] from one component to another lives here:
//!
//! - [`model`]: the canonical event record and dotted-path helpers
//! - [`topic_bus`]: topic-keyed publish/subscribe with sync or queued dispatch
//! - [`event_bus`]: the input/output/topics/metrics channels built from topic buses
//! - [`stream`]: lazy push streams and the operators workflow pipelines are made of
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────────┐  emit   ┌──────────┐  streams  ┌────────────────┐
//! │ InputManager │────────▶│ EventBus │──────────▶│ WorkflowEngine │
//! └──────────────┘         └──────────┘           └───────┬────────┘
//!        ▲                       ▲    publish_output      │
//!        │        loopback       └────────────────────────┤
//!        └────────────────────────────────────────────────┘
//! ```

pub mod event_bus;
pub mod model;
pub mod stream;
pub mod topic_bus;

pub use event_bus::{EventBus, EventError, EventResult};
pub use model::{Event, Meta};
pub use stream::{EventStream, Subscription};
pub use topic_bus::{DispatchMode, DropPolicy, QueuePolicy, TopicBus};
