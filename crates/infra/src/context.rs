//! Request context propagation.
//!
//! The context value types live in `causeway-core`; this module binds them
//! to the current task so correlation id, causation id, and actor are
//! visible across suspension points without threading them through every
//! signature.
//!
//! Background code (the queue worker) never inherits the spawning task's
//! context. It constructs a fresh one from event metadata via
//! `EventMetadata::background_context` and opens its own scope.

use std::future::Future;

use causeway_core::RequestContext;

tokio::task_local! {
    static CURRENT_CONTEXT: RequestContext;
}

/// Run `fut` with `ctx` as the current context.
///
/// Nested calls shadow the outer context for the inner scope only; the
/// outer binding is visible again once the inner future completes.
pub async fn scope<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(ctx, fut).await
}

/// The currently-bound context, if any.
pub fn current() -> Option<RequestContext> {
    CURRENT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}
