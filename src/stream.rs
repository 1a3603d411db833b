//! Stream adapters that attach telemetry on the first chunk
//!
//! Both adapters run the same state machine:
//!
//! ```text
//! NotStarted -> Streaming { first_chunk_pending: true }
//!            -> Streaming { first_chunk_pending: false }   (first Ok chunk, extraction)
//!            -> Exhausted                                  (source ended, span ends)
//! ```
//!
//! Chunks are handed to the consumer untouched. Dropping an adapter before
//! the source ends also ends the span.

use crate::attributes::CallArgs;
use crate::client::{ChunkIter, ChunkStream};
use crate::error::Result;
use crate::telemetry::{SpanGuard, Telemetry};
use futures::Stream;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::Tracer;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    Streaming { first_chunk_pending: bool },
    Exhausted,
}

impl StreamState {
    pub fn start(&mut self) {
        if *self == StreamState::NotStarted {
            *self = StreamState::Streaming {
                first_chunk_pending: true,
            };
        }
    }

    /// Registers a produced chunk; true exactly once, for the first chunk.
    pub fn on_chunk(&mut self) -> bool {
        match *self {
            StreamState::Streaming {
                first_chunk_pending: true,
            } => {
                *self = StreamState::Streaming {
                    first_chunk_pending: false,
                };
                true
            }
            _ => false,
        }
    }

    pub fn on_end(&mut self) {
        *self = StreamState::Exhausted;
    }

    pub fn is_exhausted(&self) -> bool {
        *self == StreamState::Exhausted
    }
}

/// Per-call bookkeeping shared by the sync and async adapters.
struct FirstChunk<T> {
    state: StreamState,
    span: Option<SpanGuard>,
    args: CallArgs,
    telemetry: Arc<Telemetry<T>>,
}

impl<T> FirstChunk<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn new(span: SpanGuard, args: CallArgs, telemetry: Arc<Telemetry<T>>) -> Self {
        let mut state = StreamState::NotStarted;
        state.start();
        Self {
            state,
            span: Some(span),
            args,
            telemetry,
        }
    }

    fn observe(&mut self, item: Option<&Result<Value>>) {
        match item {
            Some(Ok(chunk)) => {
                if self.state.on_chunk() {
                    if let Some(span) = &self.span {
                        self.telemetry.record(span, &self.args, chunk);
                    }
                }
            }
            Some(Err(error)) => {
                if let Some(span) = &self.span {
                    span.fail(error);
                }
            }
            None => {
                self.state.on_end();
                if let Some(span) = self.span.take() {
                    span.end();
                }
            }
        }
    }
}

impl<T> Drop for FirstChunk<T> {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            span.end();
        }
    }
}

/// Blocking chunk iterator with first-chunk extraction.
pub struct InstrumentedIter<T = BoxedTracer> {
    inner: ChunkIter,
    first: FirstChunk<T>,
}

impl<T> InstrumentedIter<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    pub fn new(
        inner: ChunkIter,
        span: SpanGuard,
        args: CallArgs,
        telemetry: Arc<Telemetry<T>>,
    ) -> Self {
        Self {
            inner,
            first: FirstChunk::new(span, args, telemetry),
        }
    }

    pub fn state(&self) -> StreamState {
        self.first.state
    }
}

impl<T> Iterator for InstrumentedIter<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first.state.is_exhausted() {
            return None;
        }
        let item = self.inner.next();
        self.first.observe(item.as_ref());
        item
    }
}

/// Async chunk stream with first-chunk extraction.
pub struct InstrumentedStream<T = BoxedTracer> {
    inner: ChunkStream,
    first: FirstChunk<T>,
}

impl<T> InstrumentedStream<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    pub fn new(
        inner: ChunkStream,
        span: SpanGuard,
        args: CallArgs,
        telemetry: Arc<Telemetry<T>>,
    ) -> Self {
        Self {
            inner,
            first: FirstChunk::new(span, args, telemetry),
        }
    }

    pub fn state(&self) -> StreamState {
        self.first.state
    }
}

impl<T> Stream for InstrumentedStream<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.first.state.is_exhausted() {
            return Poll::Ready(None);
        }
        let item = futures::ready!(this.inner.as_mut().poll_next(cx));
        this.first.observe(item.as_ref());
        Poll::Ready(item)
    }
}
