//! Span lifecycle and record emission shared by every instrumented call

use crate::attributes::{AttributeExtractor, CallArgs};
use crate::client::Target;
use crate::config::InstrumentationConfig;
use crate::error::ClientError;
use crate::metrics::{UsageCounters, UsageRecorder};
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_semantic_conventions::attribute::{
    ERROR_TYPE, GEN_AI_OPERATION_NAME, GEN_AI_SYSTEM,
};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Returns a `'static` copy of an instrumentation scope name.
///
/// The global tracer and meter lookups take `'static` names; each distinct
/// name is leaked once and reused afterwards.
pub(crate) fn static_scope(scope: impl Into<String>) -> &'static str {
    static SCOPES: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();

    let scope = scope.into();
    let mut scopes = SCOPES
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = scopes.get(scope.as_str()) {
        return existing;
    }
    let leaked: &'static str = Box::leak(scope.into_boxed_str());
    scopes.insert(leaked);
    leaked
}

/// Tracer, extractor and usage sink used by instrumented calls.
pub struct Telemetry<T = BoxedTracer> {
    tracer: T,
    extractor: AttributeExtractor,
    usage: Arc<dyn UsageRecorder>,
}

impl Telemetry<BoxedTracer> {
    /// Telemetry backed by the global tracer and meter providers.
    pub fn global() -> Self {
        Self::from_config(&InstrumentationConfig::default())
    }

    pub fn from_config(config: &InstrumentationConfig) -> Self {
        let scope = static_scope(config.scope.clone());
        Self::new(
            global::tracer(scope),
            Arc::new(UsageCounters::global(scope)),
            config,
        )
    }
}

impl<T> Telemetry<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    pub fn new(tracer: T, usage: Arc<dyn UsageRecorder>, config: &InstrumentationConfig) -> Self {
        Self {
            tracer,
            extractor: AttributeExtractor::from_config(config),
            usage,
        }
    }

    pub fn extractor(&self) -> &AttributeExtractor {
        &self.extractor
    }

    /// Span name for a target, e.g. `openai.ChatCompletion.create`.
    pub fn span_name(&self, target: Target) -> String {
        format!("{}.{}", self.extractor.namespace(), target.qualified_name())
    }

    /// Starts a client span for `target` as a child of the current context.
    pub fn start_call(&self, target: Target) -> SpanGuard {
        let span = self
            .tracer
            .span_builder(self.span_name(target))
            .with_kind(SpanKind::Client)
            .with_attributes(vec![
                KeyValue::new(GEN_AI_SYSTEM, "openai"),
                KeyValue::new(GEN_AI_OPERATION_NAME, target.kind.operation()),
            ])
            .start(&self.tracer);
        SpanGuard::new(Context::current_with_span(span))
    }

    /// Runs one extraction pass and attaches the result to `span`.
    ///
    /// Usage samples are forwarded to the usage recorder.
    pub fn record(&self, span: &SpanGuard, args: &CallArgs, response: &Value) {
        let record = self.extractor.extract(args, response);
        for sample in &record.usage {
            self.usage.record(sample);
        }
        span.set_attributes(record.attributes);
    }
}

pub(crate) fn start_internal<T>(
    tracer: &T,
    name: impl Into<Cow<'static, str>>,
    attributes: Vec<KeyValue>,
) -> SpanGuard
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    let span = tracer
        .span_builder(name)
        .with_kind(SpanKind::Internal)
        .with_attributes(attributes)
        .start(tracer);
    SpanGuard::new(Context::current_with_span(span))
}

/// Owns a started span until it is explicitly ended.
///
/// A guard dropped without [`SpanGuard::end`] marks the span as failed with
/// the message `cancelled` before ending it, which covers dropped futures and
/// unwinding.
#[must_use = "dropping the guard ends the span as cancelled"]
pub struct SpanGuard {
    cx: Context,
    ended: bool,
}

impl SpanGuard {
    fn new(cx: Context) -> Self {
        Self { cx, ended: false }
    }

    /// Context carrying the span, for parenting nested work.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn set_attribute(&self, attribute: KeyValue) {
        self.cx.span().set_attribute(attribute);
    }

    pub fn set_attributes(&self, attributes: impl IntoIterator<Item = KeyValue>) {
        self.cx.span().set_attributes(attributes);
    }

    /// Marks the span as failed with the error's message and type.
    pub fn fail(&self, error: &ClientError) {
        let span = self.cx.span();
        span.set_status(Status::error(error.to_string()));
        span.set_attribute(KeyValue::new(ERROR_TYPE, error.error_type()));
    }

    pub fn end(mut self) {
        self.finish();
    }

    /// Releases the span context; the caller becomes responsible for ending it.
    pub(crate) fn into_context(mut self) -> Context {
        self.ended = true;
        std::mem::replace(&mut self.cx, Context::new())
    }

    fn finish(&mut self) {
        if !self.ended {
            self.ended = true;
            self.cx.span().end();
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if !self.ended {
            self.cx.span().set_status(Status::error("cancelled"));
            self.finish();
        }
    }
}
