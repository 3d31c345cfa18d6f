//! Action registry for dispatching inbound requests by Profile.
//!
//! Actions are keyed by the request's `Profile` property. Closures taking
//! an [`InboundRequest`] and returning a future are actions; so is any
//! explicit [`Action`] implementation.
//!
//! # Example
//!
//! ```ignore
//! let conn = Connection::builder()
//!     .action("echo", |req: InboundRequest| async move {
//!         req.respond(req.body().to_vec(), Some("text/plain; charset=UTF-8"))
//!     })
//!     .connect(transport);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;

use super::InboundRequest;

/// Boxed future returned by actions.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// A handler for inbound requests of one Profile.
///
/// Returning `Err` makes the connection answer with a `HandlerFailed` (501)
/// ERR carrying the error text, unless the action already replied or the
/// request is NoReply.
pub trait Action: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, request: InboundRequest) -> ActionFuture;
}

impl<F, Fut> Action for F
where
    F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, request: InboundRequest) -> ActionFuture {
        Box::pin((self)(request))
    }
}

/// Registry mapping Profile strings to actions.
#[derive(Default)]
pub(crate) struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile: impl Into<String>, action: Arc<dyn Action>) {
        self.actions.insert(profile.into(), action);
    }

    pub fn get(&self, profile: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(profile).cloned()
    }
}
