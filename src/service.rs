//! Service side of certificate rotation: request validation, issuance through
//! a CA backend, the audit store and the HTTP surface.

pub mod ca;
pub mod handler;
pub mod http;
pub mod issuer;
pub mod store;
pub mod validator;

pub const TRACING_COMPONENT: &str = "certrotate/service";
