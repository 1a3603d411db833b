//! Test fixtures: an in-memory tracer and scripted client endpoints

use crate::attributes::CallArgs;
use crate::client::{is_streaming, ApiResource, AsyncCreate, AsyncReply, CallKind, Create, OpenAIClient, Reply};
use crate::config::InstrumentationConfig;
use crate::error::{ClientError, Result};
use crate::metrics::{InMemoryUsage, UsageRecorder};
use crate::telemetry::Telemetry;
use async_trait::async_trait;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct TestTracing {
    exporter: InMemorySpanExporter,
    provider: TracerProvider,
}

impl TestTracing {
    pub(crate) fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        Self { exporter, provider }
    }

    pub(crate) fn tracer(&self) -> Tracer {
        self.provider.tracer("test")
    }

    pub(crate) fn telemetry(&self, usage: InMemoryUsage) -> Arc<Telemetry<Tracer>> {
        self.telemetry_with(Arc::new(usage))
    }

    pub(crate) fn telemetry_with(&self, usage: Arc<dyn UsageRecorder>) -> Arc<Telemetry<Tracer>> {
        Arc::new(Telemetry::new(
            self.tracer(),
            usage,
            &InstrumentationConfig::default(),
        ))
    }

    /// Spans ended so far, in end order.
    pub(crate) fn spans(&self) -> Vec<SpanData> {
        self.exporter.get_finished_spans().unwrap()
    }
}

pub(crate) fn attr(span: &SpanData, key: &str) -> Option<opentelemetry::Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

pub(crate) fn call_args(value: Value) -> CallArgs {
    value.as_object().cloned().unwrap_or_default()
}

#[derive(Clone)]
enum Script {
    Complete(Value),
    Stream(Vec<Value>, Option<String>),
    Fail(String),
    Pending,
}

/// Endpoint that answers every call from a fixed script.
pub(crate) struct FakeEndpoint {
    script: Script,
    calls: AtomicUsize,
}

impl FakeEndpoint {
    fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn complete(response: Value) -> Self {
        Self::new(Script::Complete(response))
    }

    pub(crate) fn streaming(chunks: Vec<Value>) -> Self {
        Self::new(Script::Stream(chunks, None))
    }

    pub(crate) fn streaming_then_fail(chunks: Vec<Value>, message: &str) -> Self {
        Self::new(Script::Stream(chunks, Some(message.to_string())))
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self::new(Script::Fail(message.to_string()))
    }

    pub(crate) fn pending() -> Self {
        Self::new(Script::Pending)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn items(chunks: &[Value], failure: &Option<String>) -> Vec<Result<Value>> {
        let mut items: Vec<Result<Value>> = chunks.iter().cloned().map(Ok).collect();
        if let Some(message) = failure {
            items.push(Err(ClientError::Stream(message.clone())));
        }
        items
    }
}

impl Create for FakeEndpoint {
    fn create(&self, args: &CallArgs) -> Result<Reply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Complete(response) => Ok(Reply::Complete(response.clone())),
            Script::Stream(chunks, failure) => {
                assert!(is_streaming(args), "scripted stream called without stream=true");
                Ok(Reply::Stream(Box::new(
                    Self::items(chunks, failure).into_iter(),
                )))
            }
            Script::Fail(message) => Err(ClientError::Api(message.clone())),
            Script::Pending => panic!("blocking endpoint cannot stay pending"),
        }
    }
}

#[async_trait]
impl AsyncCreate for FakeEndpoint {
    async fn acreate(&self, args: &CallArgs) -> Result<AsyncReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Complete(response) => Ok(AsyncReply::Complete(response.clone())),
            Script::Stream(chunks, failure) => {
                assert!(is_streaming(args), "scripted stream called without stream=true");
                Ok(AsyncReply::Stream(Box::pin(futures::stream::iter(
                    Self::items(chunks, failure),
                ))))
            }
            Script::Fail(message) => Err(ClientError::Api(message.clone())),
            Script::Pending => futures::future::pending().await,
        }
    }
}

/// Client whose six call slots share one scripted endpoint per kind.
pub(crate) fn fake_client(endpoint: impl Fn(CallKind) -> Arc<FakeEndpoint>) -> OpenAIClient {
    let resource = |kind: CallKind| {
        let endpoint = endpoint(kind);
        ApiResource::new(kind, endpoint.clone(), endpoint)
    };
    OpenAIClient::new(
        resource(CallKind::ChatCompletion),
        resource(CallKind::Completion),
        resource(CallKind::Embedding),
    )
}
