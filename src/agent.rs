pub mod decision;
pub mod monitor;
pub mod renewer;
pub mod retry;
pub mod types;

/// Span target shared by agent-side rotation operations.
pub const TRACING_COMPONENT: &str = "certrotate/agent";
