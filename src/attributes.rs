//! Span attribute extraction for OpenAI calls
//!
//! Turns the keyed arguments of a call and its response (or the first chunk of
//! a streamed response) into a flat list of scalar span attributes plus the
//! token usage samples that feed the usage counters.

use crate::config::InstrumentationConfig;
use opentelemetry::KeyValue;
use serde_json::{Map, Value};

/// Keyed arguments passed to a client call.
pub type CallArgs = Map<String, Value>;

/// Attribute key segments and field names understood by the extractor.
pub struct OpenAIAttributes;

impl OpenAIAttributes {
    pub const CREATE: &'static str = "create";
    pub const RESPONSE: &'static str = "response";
    pub const USAGE: &'static str = "usage";

    /// Response fields copied onto the span.
    pub const RESPONSE_FIELDS: [&'static str; 3] = ["id", "created", "model"];

    /// Token counts copied from `usage` and reported to the usage counters.
    pub const USAGE_FIELDS: [&'static str; 3] =
        ["prompt_tokens", "completion_tokens", "total_tokens"];

    /// Label value used for counters when the response names no model.
    pub const UNKNOWN_MODEL: &'static str = "__unknown__";
}

/// One token count taken from a response's `usage` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSample {
    pub field: &'static str,
    pub value: u64,
    pub model: String,
}

/// Flat telemetry derived from one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryRecord {
    pub attributes: Vec<KeyValue>,
    pub usage: Vec<UsageSample>,
}

impl TelemetryRecord {
    /// Looks up an attribute by its full key.
    pub fn get(&self, key: &str) -> Option<&opentelemetry::Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.usage.is_empty()
    }
}

/// Converts a JSON value into a span attribute value when it is a scalar.
///
/// Strings, booleans, integers and floats are admitted. `null`, arrays and
/// objects yield `None`. Unsigned integers above `i64::MAX` fall back to a
/// float so they are still recorded.
pub fn scalar_value(value: &Value) -> Option<opentelemetry::Value> {
    match value {
        Value::String(s) => Some(s.clone().into()),
        Value::Bool(b) => Some((*b).into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.into())
            } else {
                n.as_f64().map(Into::into)
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Builds [`TelemetryRecord`]s under a configurable namespace.
#[derive(Debug, Clone)]
pub struct AttributeExtractor {
    namespace: String,
    denylist: Vec<String>,
}

impl Default for AttributeExtractor {
    fn default() -> Self {
        Self::from_config(&InstrumentationConfig::default())
    }
}

impl AttributeExtractor {
    pub fn from_config(config: &InstrumentationConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            denylist: config.denylist.clone(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_denied(&self, key: &str) -> bool {
        self.denylist.iter().any(|denied| denied == key)
    }

    fn key(&self, section: &str, field: &str) -> String {
        format!("{}.{}.{}", self.namespace, section, field)
    }

    /// Extracts request attributes from the call arguments and response
    /// attributes plus usage samples from the response.
    pub fn extract(&self, args: &CallArgs, response: &Value) -> TelemetryRecord {
        let mut record = TelemetryRecord {
            attributes: self.request_attributes(args),
            usage: Vec::new(),
        };
        self.response_attributes(response, &mut record);
        record
    }

    /// `<namespace>.create.<key>` for every scalar, non-denied argument.
    pub fn request_attributes(&self, args: &CallArgs) -> Vec<KeyValue> {
        args.iter()
            .filter(|(key, _)| !self.is_denied(key))
            .filter_map(|(key, value)| {
                scalar_value(value)
                    .map(|v| KeyValue::new(self.key(OpenAIAttributes::CREATE, key), v))
            })
            .collect()
    }

    fn response_attributes(&self, response: &Value, record: &mut TelemetryRecord) {
        let Some(object) = response.as_object() else {
            return;
        };

        for field in OpenAIAttributes::RESPONSE_FIELDS {
            if let Some(value) = object.get(field).and_then(scalar_value) {
                record
                    .attributes
                    .push(KeyValue::new(self.key(OpenAIAttributes::RESPONSE, field), value));
            }
        }

        let Some(usage) = object.get(OpenAIAttributes::USAGE).and_then(Value::as_object) else {
            return;
        };

        let model = object
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(OpenAIAttributes::UNKNOWN_MODEL);

        for field in OpenAIAttributes::USAGE_FIELDS {
            // Token counts are non-negative integers; anything else is dropped.
            if let Some(count) = usage.get(field).and_then(Value::as_u64) {
                let value = i64::try_from(count)
                    .map(opentelemetry::Value::from)
                    .unwrap_or_else(|_| opentelemetry::Value::from(count as f64));
                record
                    .attributes
                    .push(KeyValue::new(self.key(OpenAIAttributes::USAGE, field), value));
                record.usage.push(UsageSample {
                    field,
                    value: count,
                    model: model.to_string(),
                });
            }
        }
    }
}
