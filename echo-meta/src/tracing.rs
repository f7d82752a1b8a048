use tracing::Span;

use crate::context::ServerContext;

/// Hooks for wrapping each served call in a span.
pub trait SpanProvider: 'static + Send + Sync + Clone {
    fn on_serve(&self, context: &ServerContext) -> Span {
        let _ = context;
        Span::none()
    }

    fn leave_serve(&self, context: &ServerContext) {
        let _ = context;
    }
}

/// Opens an `rpc` span per call carrying the method and shape, and logs how long the call took
/// when it leaves.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultProvider;

impl SpanProvider for DefaultProvider {
    fn on_serve(&self, context: &ServerContext) -> Span {
        let info = context.rpc_info();
        tracing::info_span!("rpc", method = %info.method(), shape = ?info.shape())
    }

    fn leave_serve(&self, context: &ServerContext) {
        if let (Some(start), Some(end)) = (
            context.stats.process_start_at(),
            context.stats.process_end_at(),
        ) {
            tracing::trace!(
                "[ECHO] {} served in {}us",
                context.rpc_info().method(),
                (end - start).num_microseconds().unwrap_or_default()
            );
        }
    }
}

/// Serves calls without any span.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProvider;

impl SpanProvider for NoopProvider {}
