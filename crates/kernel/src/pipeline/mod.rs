//! Per-event plugin pipeline.
//!
//! The registry resolves a team's plugins, the invoker wraps each call in
//! retries and metrics, and the dispatcher runs the two event stages and
//! on-demand tasks.

mod dispatcher;
mod invoke;
mod registry;
pub mod retry;

pub use dispatcher::{EventPipeline, OnEventSummary, TaskOutcome};
pub use invoke::{InvocationContext, Invoker, RetryPredicate, StagePolicies};
pub use registry::{TeamExtensions, TenantExtensionRegistry};
pub use retry::{Attempted, Backoff, Exhausted, RetryPolicy};
