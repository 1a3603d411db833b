//! HTTP transport backing the call slots of [`OpenAIClient::http`]
//!
//! Requests go through a `reqwest_middleware::ClientWithMiddleware`, so any
//! middleware stack can sit underneath the instrumentation. Streamed calls are
//! read as server-sent events until the `[DONE]` marker.

use crate::attributes::CallArgs;
use crate::client::{
    is_streaming, ApiResource, AsyncCreate, AsyncReply, CallKind, ChunkStream, Create,
    OpenAIClient, Reply,
};
use crate::config::{HttpConfig, ENV_API_BASE};
use crate::error::{ClientError, ConfigError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{future, StreamExt};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

/// Data line that terminates an OpenAI event stream.
const DONE: &str = "[DONE]";

/// Sends OpenAI API requests over HTTP.
pub struct HttpTransport {
    client: ClientWithMiddleware,
    config: Arc<HttpConfig>,
}

impl HttpTransport {
    pub fn new(client: ClientWithMiddleware, config: HttpConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    /// Transport over a plain reqwest client without extra middleware.
    pub fn from_config(config: HttpConfig) -> Result<Self, ConfigError> {
        reqwest::Url::parse(&config.api_base).map_err(|e| ConfigError::InvalidValue {
            name: ENV_API_BASE,
            reason: e.to_string(),
        })?;
        let client = ClientBuilder::new(reqwest::Client::builder().build()?).build();
        Ok(Self::new(client, config))
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Posts `args` to the endpoint of `kind`.
    ///
    /// With `"stream": true` the reply is a stream of decoded event payloads,
    /// otherwise the decoded response body.
    pub async fn request(&self, kind: CallKind, args: &CallArgs) -> Result<AsyncReply> {
        let url = self.config.endpoint(kind.path());
        let body = Bytes::from(serde_json::to_vec(args)?);
        debug!(%url, stream = is_streaming(args), "sending OpenAI request");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .header(http::header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        if is_streaming(args) {
            return Ok(AsyncReply::Stream(event_chunks(response)));
        }

        let body = response.bytes().await?;
        Ok(AsyncReply::Complete(serde_json::from_slice(&body)?))
    }

    /// Builds a client whose six call slots are served by this transport.
    pub fn into_client(self) -> OpenAIClient {
        let transport = Arc::new(self);
        let runtime = Arc::new(BlockingRuntime::default());
        let resource = |kind: CallKind| {
            let endpoint = HttpEndpoint {
                transport: transport.clone(),
                kind,
            };
            let blocking = BlockingEndpoint {
                endpoint: endpoint.clone(),
                runtime: runtime.clone(),
            };
            ApiResource::new(kind, Arc::new(blocking), Arc::new(endpoint))
        };
        OpenAIClient::new(
            resource(CallKind::ChatCompletion),
            resource(CallKind::Completion),
            resource(CallKind::Embedding),
        )
    }
}

fn event_chunks(response: reqwest::Response) -> ChunkStream {
    let chunks = response
        .bytes_stream()
        .eventsource()
        .take_while(|event| {
            let done = matches!(event, Ok(event) if event.data.trim() == DONE);
            future::ready(!done)
        })
        .map(|event| match event {
            Ok(event) => serde_json::from_str::<Value>(&event.data).map_err(ClientError::from),
            Err(e) => Err(ClientError::Stream(e.to_string())),
        });
    Box::pin(chunks)
}

impl OpenAIClient {
    /// Client talking to the OpenAI HTTP API described by `config`.
    pub fn http(config: HttpConfig) -> Result<Self, ConfigError> {
        Ok(HttpTransport::from_config(config)?.into_client())
    }
}

/// Async implementation of one kind of call.
#[derive(Clone)]
pub struct HttpEndpoint {
    transport: Arc<HttpTransport>,
    kind: CallKind,
}

#[async_trait]
impl AsyncCreate for HttpEndpoint {
    async fn acreate(&self, args: &CallArgs) -> Result<AsyncReply> {
        self.transport.request(self.kind, args).await
    }
}

/// Current-thread runtime shared by the blocking endpoints of one client,
/// built on the first blocking call.
#[derive(Default)]
struct BlockingRuntime {
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl BlockingRuntime {
    fn get(&self) -> Result<Arc<Runtime>> {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = runtime.as_ref() {
            return Ok(runtime.clone());
        }
        let built = Arc::new(Builder::new_current_thread().enable_all().build()?);
        *runtime = Some(built.clone());
        Ok(built)
    }
}

/// Blocking implementation of one kind of call.
///
/// Drives the async endpoint on a private runtime, so it must not be called
/// from inside another tokio runtime.
pub struct BlockingEndpoint {
    endpoint: HttpEndpoint,
    runtime: Arc<BlockingRuntime>,
}

impl Create for BlockingEndpoint {
    fn create(&self, args: &CallArgs) -> Result<Reply> {
        let runtime = self.runtime.get()?;
        match runtime.block_on(self.endpoint.acreate(args))? {
            AsyncReply::Complete(response) => Ok(Reply::Complete(response)),
            AsyncReply::Stream(chunks) => Ok(Reply::Stream(Box::new(BlockingChunks {
                chunks,
                runtime,
            }))),
        }
    }
}

/// Event stream read one chunk at a time on the blocking runtime.
struct BlockingChunks {
    chunks: ChunkStream,
    runtime: Arc<Runtime>,
}

impl Iterator for BlockingChunks {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.chunks.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentor::OpenAIInstrumentor;
    use crate::metrics::InMemoryUsage;
    use crate::testing::{attr, call_args, TestTracing};
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use opentelemetry::Value as OtelValue;
    use serde_json::json;

    fn client_for(server: &MockServer) -> OpenAIClient {
        OpenAIClient::http(HttpConfig::new("test-key").with_api_base(server.url("/v1"))).unwrap()
    }

    fn event_body(chunks: &[Value]) -> String {
        let mut body: String = chunks
            .iter()
            .map(|chunk| format!("data: {}\n\n", chunk))
            .collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn chat_response() -> Value {
        json!({
            "id": "chatcmpl-1",
            "created": 1_700_000_000,
            "model": "m1",
            "choices": [{"message": {"role": "assistant", "content": "pong"}}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
        })
    }

    #[test]
    fn test_invalid_api_base() {
        let result = OpenAIClient::http(HttpConfig::new("k").with_api_base("not a url"));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { name: ENV_API_BASE, .. })
        ));
    }

    #[tokio::test]
    async fn test_async_complete_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer test-key")
                    .header("content-type", "application/json")
                    .json_body(json!({"model": "m1", "messages": [{"role": "user", "content": "ping"}]}));
                then.status(200).json_body(chat_response());
            })
            .await;

        let client = client_for(&server);
        let args = call_args(json!({"model": "m1", "messages": [{"role": "user", "content": "ping"}]}));
        let reply = client.chat_completion.acreate(&args).await.unwrap();

        mock.assert_async().await;
        assert_eq!(reply.into_complete(), Some(chat_response()));
    }

    #[tokio::test]
    async fn test_async_event_stream_stops_at_done() {
        let server = MockServer::start_async().await;
        let chunks = vec![
            json!({"id": "c1", "model": "m1", "choices": [{"delta": {"content": "po"}}]}),
            json!({"id": "c1", "model": "m1", "choices": [{"delta": {"content": "ng"}}]}),
        ];
        let body = event_body(&chunks);
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/completions")
                    .body_contains("\"stream\":true");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;

        let client = client_for(&server);
        let args = call_args(json!({"model": "m1", "prompt": "pi", "stream": true}));
        let stream = client
            .completion
            .acreate(&args)
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        let received: Vec<Value> = stream.map(|chunk| chunk.unwrap()).collect().await;

        assert_eq!(received, chunks);
    }

    #[tokio::test]
    async fn test_error_status_is_returned() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(429).body("rate limited");
            })
            .await;

        let client = client_for(&server);
        let error = client
            .embedding
            .acreate(&call_args(json!({"model": "e1", "input": "x"})))
            .await
            .unwrap_err();

        match error {
            ClientError::Status { status, body } => {
                assert_eq!(status, http::StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(body, "rate limited");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_blocking_calls() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(chat_response());
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/v1/completions")
                .body_contains("\"stream\":true");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(event_body(&[json!({"id": "c1", "model": "m1"}), json!({"id": "c1"})]));
        });

        let client = client_for(&server);

        let reply = client
            .chat_completion
            .create(&call_args(json!({"model": "m1"})))
            .unwrap();
        assert_eq!(reply.into_complete(), Some(chat_response()));

        let chunks: Vec<Value> = client
            .completion
            .create(&call_args(json!({"model": "m1", "stream": true})))
            .unwrap()
            .into_stream()
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect();
        assert_eq!(chunks, vec![json!({"id": "c1", "model": "m1"}), json!({"id": "c1"})]);
    }

    #[tokio::test]
    async fn test_instrumented_http_stream() {
        let server = MockServer::start_async().await;
        let first = json!({
            "id": "c1",
            "created": 1_700_000_000,
            "model": "m1",
            "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
        });
        let body = event_body(&[first, json!({"id": "c1", "model": "m1"})]);
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;

        let tracing = TestTracing::new();
        let usage = InMemoryUsage::default();
        let instrumentor =
            OpenAIInstrumentor::new([CallKind::ChatCompletion], tracing.telemetry(usage.clone()));
        let client = client_for(&server);
        instrumentor.instrument(&client);

        let args = call_args(json!({"model": "m1", "stream": true, "temperature": 0.2}));
        let stream = client
            .chat_completion
            .acreate(&args)
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        let received: Vec<Value> = stream.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(received.len(), 2);

        let spans = tracing.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "openai.ChatCompletion.acreate");
        assert_eq!(attr(&spans[0], "openai.create.stream"), Some(OtelValue::Bool(true)));
        assert_eq!(attr(&spans[0], "openai.response.id"), Some(OtelValue::from("c1")));
        assert_eq!(usage.total("prompt_tokens", "m1"), 7);
        assert_eq!(usage.total("total_tokens", "m1"), 10);
    }
}
