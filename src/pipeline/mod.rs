//! Request-admission pipeline core.
//!
//! - [`context`]: per-request facts and scratch state
//! - [`composer`]: the [`Stage`] chain, fault boundary and post-processing
//! - [`security_headers`]: the fixed response header set
//!
//! The stages themselves live in [`crate::middleware`].

pub mod composer;
pub mod context;
pub mod security_headers;

pub use composer::{
    BusinessHandler, DEFAULT_MAX_BODY_SIZE, Next, Pipeline, PipelineBuilder, PipelineFault, Stage,
};
pub use context::{AuthenticatedIdentity, MiddlewareContext, RequestContext};
