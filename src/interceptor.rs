use crate::attributes::CallArgs;
use crate::client::{is_streaming, AsyncCreate, AsyncReply, Create, Reply, Target};
use crate::error::Result;
use crate::stream::{InstrumentedIter, InstrumentedStream};
use crate::telemetry::{SpanGuard, Telemetry};
use async_trait::async_trait;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{FutureExt, Tracer};
use std::sync::Arc;
use tracing::debug;

/// Decorator that traces every call made through it.
///
/// Wraps the real implementation of one call site and implements the same
/// trait, so it can be injected anywhere the original is expected or
/// installed into a [`crate::CallSlot`] by the instrumentor.
pub struct Instrumented<C: ?Sized, T = BoxedTracer> {
    inner: Arc<C>,
    target: Target,
    telemetry: Arc<Telemetry<T>>,
}

impl<C: ?Sized, T> Instrumented<C, T> {
    pub fn new(inner: Arc<C>, target: Target, telemetry: Arc<Telemetry<T>>) -> Self {
        Self {
            inner,
            target,
            telemetry,
        }
    }

    /// The wrapped implementation.
    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    pub fn target(&self) -> Target {
        self.target
    }
}

impl<C: ?Sized, T> Instrumented<C, T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn complete(&self, span: SpanGuard, args: &CallArgs, response: &serde_json::Value) {
        if is_streaming(args) {
            debug!(target_call = %self.target, "stream requested but a complete response was returned");
        }
        self.telemetry.record(&span, args, response);
        span.end();
    }
}

impl<C, T> Create for Instrumented<C, T>
where
    C: Create + ?Sized,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    fn create(&self, args: &CallArgs) -> Result<Reply> {
        let span = self.telemetry.start_call(self.target);
        let reply = {
            let _attached = span.context().clone().attach();
            self.inner.create(args)
        };

        match reply {
            Ok(Reply::Complete(response)) => {
                self.complete(span, args, &response);
                Ok(Reply::Complete(response))
            }
            Ok(Reply::Stream(chunks)) => Ok(Reply::Stream(Box::new(InstrumentedIter::new(
                chunks,
                span,
                args.clone(),
                self.telemetry.clone(),
            )))),
            Err(error) => {
                span.fail(&error);
                span.end();
                Err(error)
            }
        }
    }
}

#[async_trait]
impl<C, T> AsyncCreate for Instrumented<C, T>
where
    C: AsyncCreate + ?Sized,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    async fn acreate(&self, args: &CallArgs) -> Result<AsyncReply> {
        let span = self.telemetry.start_call(self.target);
        let reply = self
            .inner
            .acreate(args)
            .with_context(span.context().clone())
            .await;

        match reply {
            Ok(AsyncReply::Complete(response)) => {
                self.complete(span, args, &response);
                Ok(AsyncReply::Complete(response))
            }
            Ok(AsyncReply::Stream(chunks)) => Ok(AsyncReply::Stream(Box::pin(
                InstrumentedStream::new(chunks, span, args.clone(), self.telemetry.clone()),
            ))),
            Err(error) => {
                span.fail(&error);
                span.end();
                Err(error)
            }
        }
    }
}
