//! Inbound request handling: action trait, registry, and the request
//! wrapper handed to actions.

mod context;
mod registry;

pub use context::InboundRequest;
pub(crate) use context::Responder;
pub use registry::{Action, ActionFuture};
pub(crate) use registry::ActionRegistry;
