//! Install and remove instrumentation on a client's call slots

use crate::client::{AsyncCreate, CallKind, Create, Mode, OpenAIClient, Target};
use crate::config::InstrumentationConfig;
use crate::interceptor::Instrumented;
use crate::telemetry::Telemetry;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::Tracer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Implementation that was in a slot before instrumentation.
enum Original {
    Blocking(Arc<dyn Create>),
    Async(Arc<dyn AsyncCreate>),
}

/// Wraps the `create` and `acreate` slots of selected call kinds with
/// [`Instrumented`] decorators.
///
/// The implementation found in a slot at install time is remembered per
/// client and target. Installing twice is a no-op for targets that are
/// already instrumented, so [`OpenAIInstrumentor::uninstrument`] always
/// restores the true original.
///
/// ```rust,no_run
/// use openai_instrumentation::{HttpConfig, OpenAIClient, OpenAIInstrumentor};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = OpenAIClient::http(HttpConfig::from_env()?)?;
/// let instrumentor = OpenAIInstrumentor::chat_completions();
/// instrumentor.instrument(&client);
/// // ... calls through client.chat_completion are traced ...
/// instrumentor.uninstrument(&client);
/// # Ok(())
/// # }
/// ```
pub struct OpenAIInstrumentor<T = BoxedTracer> {
    kinds: Vec<CallKind>,
    telemetry: Arc<Telemetry<T>>,
    originals: Mutex<HashMap<(u64, Target), Original>>,
}

impl OpenAIInstrumentor<BoxedTracer> {
    /// Chat completions only.
    pub fn chat_completions() -> Self {
        Self::with_kinds([CallKind::ChatCompletion])
    }

    /// Chat completions and text completions.
    pub fn completions() -> Self {
        Self::with_kinds([CallKind::ChatCompletion, CallKind::Completion])
    }

    /// Every call kind, embeddings included.
    pub fn all() -> Self {
        Self::with_kinds(CallKind::ALL)
    }

    /// Global tracer and meter, configured from `config`.
    pub fn from_config(
        kinds: impl IntoIterator<Item = CallKind>,
        config: &InstrumentationConfig,
    ) -> Self {
        Self::new(kinds, Arc::new(Telemetry::from_config(config)))
    }

    fn with_kinds(kinds: impl IntoIterator<Item = CallKind>) -> Self {
        Self::new(kinds, Arc::new(Telemetry::global()))
    }
}

impl<T> OpenAIInstrumentor<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    pub fn new(kinds: impl IntoIterator<Item = CallKind>, telemetry: Arc<Telemetry<T>>) -> Self {
        let mut kinds: Vec<CallKind> = kinds.into_iter().collect();
        kinds.sort();
        kinds.dedup();
        Self {
            kinds,
            telemetry,
            originals: Mutex::new(HashMap::new()),
        }
    }

    pub fn telemetry(&self) -> &Arc<Telemetry<T>> {
        &self.telemetry
    }

    /// Blocking and async targets for every configured kind.
    pub fn targets(&self) -> Vec<Target> {
        self.kinds
            .iter()
            .flat_map(|&kind| [Target::blocking(kind), Target::nonblocking(kind)])
            .collect()
    }

    /// Wraps every target slot of `client` that is not wrapped yet.
    pub fn instrument(&self, client: &OpenAIClient) {
        let mut originals = self.originals.lock().unwrap_or_else(PoisonError::into_inner);

        for target in self.targets() {
            let key = (client.id(), target);
            if originals.contains_key(&key) {
                warn!(client = client.id(), target_call = %target, "already instrumented, skipping");
                continue;
            }

            let resource = client.resource(target.kind);
            let original = match target.mode {
                Mode::Blocking => {
                    let slot = resource.create_slot();
                    let original = slot.get();
                    let wrapper = Instrumented::new(original.clone(), target, self.telemetry.clone());
                    slot.replace(Arc::new(wrapper));
                    Original::Blocking(original)
                }
                Mode::Async => {
                    let slot = resource.acreate_slot();
                    let original = slot.get();
                    let wrapper = Instrumented::new(original.clone(), target, self.telemetry.clone());
                    slot.replace(Arc::new(wrapper));
                    Original::Async(original)
                }
            };
            originals.insert(key, original);
            debug!(client = client.id(), target_call = %target, "instrumented");
        }
    }

    /// Puts back the implementations recorded by [`Self::instrument`].
    ///
    /// Targets that were never instrumented on `client` are left alone.
    pub fn uninstrument(&self, client: &OpenAIClient) {
        let mut originals = self.originals.lock().unwrap_or_else(PoisonError::into_inner);

        for target in self.targets() {
            let Some(original) = originals.remove(&(client.id(), target)) else {
                continue;
            };
            let resource = client.resource(target.kind);
            match original {
                Original::Blocking(original) => {
                    resource.create_slot().replace(original);
                }
                Original::Async(original) => {
                    resource.acreate_slot().replace(original);
                }
            }
            debug!(client = client.id(), target_call = %target, "uninstrumented");
        }
    }

    /// Whether any target of `client` is currently wrapped by this instrumentor.
    pub fn is_instrumented(&self, client: &OpenAIClient) -> bool {
        self.originals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|(id, _)| *id == client.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::CallArgs;
    use crate::metrics::InMemoryUsage;
    use crate::testing::{attr, call_args, fake_client, FakeEndpoint, TestTracing};
    use opentelemetry::Value as OtelValue;
    use serde_json::json;

    fn response(model: &str) -> serde_json::Value {
        json!({
            "id": "resp-1",
            "model": model,
            "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
        })
    }

    fn complete_client() -> OpenAIClient {
        fake_client(|_| Arc::new(FakeEndpoint::complete(response("m1"))))
    }

    fn slots(client: &OpenAIClient) -> Vec<(Arc<dyn Create>, Arc<dyn AsyncCreate>)> {
        CallKind::ALL
            .iter()
            .map(|&kind| {
                let resource = client.resource(kind);
                (resource.create_slot().get(), resource.acreate_slot().get())
            })
            .collect()
    }

    fn assert_same_slots(
        left: &[(Arc<dyn Create>, Arc<dyn AsyncCreate>)],
        right: &[(Arc<dyn Create>, Arc<dyn AsyncCreate>)],
    ) {
        for ((create_a, acreate_a), (create_b, acreate_b)) in left.iter().zip(right) {
            assert!(Arc::ptr_eq(create_a, create_b));
            assert!(Arc::ptr_eq(acreate_a, acreate_b));
        }
    }

    #[test]
    fn test_uninstrument_restores_identical_originals() {
        let tracing = TestTracing::new();
        let instrumentor = OpenAIInstrumentor::new(
            CallKind::ALL,
            tracing.telemetry(InMemoryUsage::default()),
        );
        let client = complete_client();
        let before = slots(&client);

        instrumentor.instrument(&client);
        assert!(instrumentor.is_instrumented(&client));
        let wrapped = slots(&client);
        for ((create, acreate), (original_create, original_acreate)) in wrapped.iter().zip(&before) {
            assert!(!Arc::ptr_eq(create, original_create));
            assert!(!Arc::ptr_eq(acreate, original_acreate));
        }

        instrumentor.uninstrument(&client);
        assert!(!instrumentor.is_instrumented(&client));
        assert_same_slots(&slots(&client), &before);
    }

    #[test]
    fn test_double_instrument_keeps_true_original() {
        let tracing = TestTracing::new();
        let instrumentor = OpenAIInstrumentor::new(
            [CallKind::ChatCompletion],
            tracing.telemetry(InMemoryUsage::default()),
        );
        let client = complete_client();
        let before = slots(&client);

        instrumentor.instrument(&client);
        let first_wrap = slots(&client);
        instrumentor.instrument(&client);
        assert_same_slots(&slots(&client), &first_wrap);

        client
            .chat_completion
            .create(&call_args(json!({"model": "m1"})))
            .unwrap();
        assert_eq!(tracing.spans().len(), 1);

        instrumentor.uninstrument(&client);
        assert_same_slots(&slots(&client), &before);

        client
            .chat_completion
            .create(&call_args(json!({"model": "m1"})))
            .unwrap();
        assert_eq!(tracing.spans().len(), 1);
    }

    #[test]
    fn test_uninstrument_without_instrument_is_noop() {
        let tracing = TestTracing::new();
        let instrumentor = OpenAIInstrumentor::new(
            CallKind::ALL,
            tracing.telemetry(InMemoryUsage::default()),
        );
        let client = complete_client();
        let before = slots(&client);

        instrumentor.uninstrument(&client);
        assert_same_slots(&slots(&client), &before);
    }

    #[test]
    fn test_variants_cover_their_kinds() {
        let tracing = TestTracing::new();
        let telemetry = tracing.telemetry(InMemoryUsage::default());

        let chat = OpenAIInstrumentor::new([CallKind::ChatCompletion], telemetry.clone());
        assert_eq!(
            chat.targets(),
            vec![
                Target::blocking(CallKind::ChatCompletion),
                Target::nonblocking(CallKind::ChatCompletion),
            ]
        );

        let completions = OpenAIInstrumentor::new(
            [CallKind::Completion, CallKind::ChatCompletion, CallKind::Completion],
            telemetry.clone(),
        );
        assert_eq!(completions.targets().len(), 4);

        let client = complete_client();
        let before = slots(&client);
        completions.instrument(&client);
        let after = slots(&client);

        assert!(!Arc::ptr_eq(&after[0].0, &before[0].0));
        assert!(!Arc::ptr_eq(&after[1].1, &before[1].1));
        // Embedding slots are untouched.
        assert!(Arc::ptr_eq(&after[2].0, &before[2].0));
        assert!(Arc::ptr_eq(&after[2].1, &before[2].1));
    }

    #[test]
    fn test_instruments_clients_independently() {
        let tracing = TestTracing::new();
        let instrumentor = OpenAIInstrumentor::new(
            [CallKind::Embedding],
            tracing.telemetry(InMemoryUsage::default()),
        );
        let first = complete_client();
        let second = complete_client();

        instrumentor.instrument(&first);
        assert!(instrumentor.is_instrumented(&first));
        assert!(!instrumentor.is_instrumented(&second));

        second.embedding.create(&CallArgs::new()).unwrap();
        assert!(tracing.spans().is_empty());

        first.embedding.create(&CallArgs::new()).unwrap();
        let spans = tracing.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "openai.Embedding.create");
    }

    #[tokio::test]
    async fn test_calls_through_client_are_traced() {
        let tracing = TestTracing::new();
        let usage = InMemoryUsage::default();
        let instrumentor = OpenAIInstrumentor::new(CallKind::ALL, tracing.telemetry(usage.clone()));
        let client = complete_client();
        instrumentor.instrument(&client);

        let args = call_args(json!({"model": "m1", "temperature": 0.5}));
        client.chat_completion.create(&args).unwrap();
        client.completion.acreate(&args).await.unwrap();
        client.embedding.acreate(&args).await.unwrap();

        let names: Vec<String> = tracing
            .spans()
            .iter()
            .map(|span| span.name.to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "openai.ChatCompletion.create",
                "openai.Completion.acreate",
                "openai.Embedding.acreate",
            ]
        );
        for span in tracing.spans() {
            assert_eq!(
                attr(&span, "openai.create.temperature"),
                Some(OtelValue::F64(0.5))
            );
            assert_eq!(attr(&span, "openai.usage.total_tokens"), Some(OtelValue::I64(10)));
        }
        assert_eq!(usage.total("total_tokens", "m1"), 30);
    }
}
