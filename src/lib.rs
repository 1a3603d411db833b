//! # openai-instrumentation
//!
//! OpenTelemetry spans and token-usage counters for OpenAI client calls.
//!
//! This library wraps the call slots of an [`OpenAIClient`] so that every call
//! is traced, with support for:
//! - Chat completions, completions and embeddings, blocking (`create`) and async (`acreate`)
//! - Streamed responses, with attributes taken from the first chunk
//! - Token usage counters labelled by model
//! - Install and uninstall at runtime, restoring the original implementations
//! - A generic helper for tracing arbitrary functions ([`FnTracer`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use openai_instrumentation::{HttpConfig, OpenAIClient, OpenAIInstrumentor};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Client backed by the OpenAI HTTP API (OPENAI_API_KEY, OPENAI_API_BASE)
//! let client = OpenAIClient::http(HttpConfig::from_env()?)?;
//!
//! // Trace every kind of call using the global tracer and meter providers
//! let instrumentor = OpenAIInstrumentor::all();
//! instrumentor.instrument(&client);
//!
//! let args = json!({
//!     "model": "gpt-4o-mini",
//!     "messages": [{"role": "user", "content": "Say hello"}],
//!     "temperature": 0.2
//! });
//! let reply = client
//!     .chat_completion
//!     .acreate(args.as_object().unwrap())
//!     .await?;
//!
//! instrumentor.uninstrument(&client);
//! # Ok(())
//! # }
//! ```
//!
//! Each call produces a client span named `openai.<Resource>.<method>` carrying
//! `openai.create.*`, `openai.response.*` and `openai.usage.*` attributes.

mod attributes;
mod client;
mod config;
mod error;
mod http_client;
mod instrumentor;
mod interceptor;
mod metrics;
mod stream;
mod telemetry;
mod trace;

#[cfg(test)]
mod testing;

// Re-export main types
pub use attributes::{
    scalar_value, AttributeExtractor, CallArgs, OpenAIAttributes, TelemetryRecord, UsageSample,
};
pub use client::{
    is_streaming, ApiResource, AsyncCreate, AsyncReply, CallKind, CallSlot, ChunkIter,
    ChunkStream, Create, Mode, OpenAIClient, Reply, Target,
};
pub use config::{HttpConfig, InstrumentationConfig};
pub use error::{ClientError, ConfigError, Result, TraceError};
pub use http_client::{BlockingEndpoint, HttpEndpoint, HttpTransport};
pub use instrumentor::OpenAIInstrumentor;
pub use interceptor::Instrumented;
pub use metrics::{InMemoryUsage, UsageCounters, UsageRecorder};
pub use stream::{InstrumentedIter, InstrumentedStream, StreamState};
pub use telemetry::{SpanGuard, Telemetry};
pub use trace::{capture_args, infer_span_name, Callable, FnTracer, SpanScope, Traced};

// Re-export configuration constants
pub mod env {
    pub use crate::config::{
        DEFAULT_API_BASE, DEFAULT_NAMESPACE, DEFAULT_SCOPE, ENV_API_BASE, ENV_API_KEY,
        ENV_DENYLIST, ENV_NAMESPACE, ENV_SCOPE,
    };
}
