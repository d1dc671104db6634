pub mod agent;
pub mod agent_args;
pub mod cert;
pub mod config;
pub mod daemon;
pub mod fs_util;
pub mod metrics;
pub mod protocol;
pub mod service;
pub mod submit;

pub use agent_args::Args;
