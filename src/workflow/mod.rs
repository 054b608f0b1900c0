//! # Workflows
//!
//! A workflow is a declarative pipeline over the event bus. The engine turns each
//! enabled [`WorkflowDefinition`] into a chain of stream operators:
//!
//! ```text
//! source (topics | inputs) ─▶ loop guard ─▶ step₁ ─▶ … ─▶ stepₙ ─▶ output dispatch
//!                                                                   ├─▶ on_output
//!                                                                   └─▶ on_loopback
//! ```
//!
//! Steps are a closed set (see [`StepDefinition`]); an unknown `type` fails to parse
//! instead of being skipped.

pub mod aggregate;
pub mod definition;
pub mod engine;
pub mod enrich;
pub mod steps;

pub use definition::{
    AggregateCountStep, BranchArm, BranchCondition, BranchElse, BranchStep, EnrichStep,
    OnError, OutputDefinition, OutputKind, StepDefinition, WorkflowDefinition,
};
pub use engine::{
    LifecycleEvent, LifecycleFn, LoopbackFn, OutputFn, WorkflowEngine, WorkflowError,
    WorkflowResult, WorkflowSinks,
};
