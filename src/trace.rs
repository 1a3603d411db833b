//! Span helpers for arbitrary functions
//!
//! [`FnTracer`] wraps plain or async functions so that every invocation runs
//! inside its own span:
//!
//! ```rust
//! use openai_instrumentation::FnTracer;
//!
//! fn add(a: i32, b: i32) -> i32 {
//!     a + b
//! }
//!
//! # fn main() -> Result<(), openai_instrumentation::TraceError> {
//! let tracer = FnTracer::global();
//!
//! // span named after the function
//! let traced = tracer.trace(add)?;
//! assert_eq!(traced.call((1, 2)), 3);
//!
//! // explicit span name, works for closures as well
//! let traced = tracer.trace_named("sum", |a: i32, b: i32| a + b)?;
//! assert_eq!(traced.call((1, 2)), 3);
//!
//! // scoped span
//! let scope = tracer.span("block");
//! let _entered = scope.enter();
//! # Ok(())
//! # }
//! ```

use crate::attributes::{scalar_value, CallArgs};
use crate::config::{InstrumentationConfig, DEFAULT_SCOPE};
use crate::error::TraceError;
use crate::telemetry::{start_internal, static_scope};
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{FutureExt, TraceContextExt, Tracer};
use opentelemetry::{Context, ContextGuard, KeyValue};
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Functions callable with their arguments packed in a tuple.
///
/// Implemented for every `Fn` taking up to eight arguments, so `f(a, b)` is
/// invoked as `f.invoke((a, b))`.
pub trait Callable<Args> {
    type Output;

    fn invoke(&self, args: Args) -> Self::Output;
}

macro_rules! impl_callable {
    ($($arg:ident),*) => {
        impl<Func, Out, $($arg,)*> Callable<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Out,
        {
            type Output = Out;

            #[allow(non_snake_case)]
            fn invoke(&self, ($($arg,)*): ($($arg,)*)) -> Out {
                (self)($($arg),*)
            }
        }
    };
}

impl_callable!();
impl_callable!(A1);
impl_callable!(A1, A2);
impl_callable!(A1, A2, A3);
impl_callable!(A1, A2, A3, A4);
impl_callable!(A1, A2, A3, A4, A5);
impl_callable!(A1, A2, A3, A4, A5, A6);
impl_callable!(A1, A2, A3, A4, A5, A6, A7);
impl_callable!(A1, A2, A3, A4, A5, A6, A7, A8);

/// Name of a function item, e.g. `add` for `my_crate::math::add::<i32>`.
///
/// Returns `None` for closures, function pointers and anything else whose
/// type does not end in a plain identifier.
pub fn infer_span_name<F>() -> Option<String> {
    let path = strip_generics(std::any::type_name::<F>());
    let name = path.trim_end_matches("::").rsplit("::").next()?;
    is_identifier(name).then(|| name.to_string())
}

fn strip_generics(path: &str) -> String {
    let mut depth = 0usize;
    let mut prev = None;
    path.chars()
        .filter(|&c| {
            let keep = match c {
                '<' => {
                    depth += 1;
                    false
                }
                // `->` in a function pointer type is not a closing bracket
                '>' if prev == Some('-') => depth == 0,
                '>' => {
                    depth = depth.saturating_sub(1);
                    false
                }
                _ => depth == 0,
            };
            prev = Some(c);
            keep
        })
        .collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {
            chars.all(|c| c.is_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Matches call arguments to parameter names.
///
/// Positional values are paired with `params` in order, keyword values are
/// taken by name. Parameters left unfilled (defaults) are not captured and
/// only scalar values are kept.
///
/// ```rust
/// use openai_instrumentation::capture_args;
/// use serde_json::json;
///
/// let keyword = json!({"c": 5}).as_object().cloned().unwrap();
/// let captured = capture_args(&["a", "b", "c", "d"], &[json!(1), json!(2)], &keyword);
/// assert_eq!(serde_json::Value::Object(captured), json!({"a": 1, "b": 2, "c": 5}));
/// ```
pub fn capture_args<S: AsRef<str>>(params: &[S], positional: &[Value], keyword: &CallArgs) -> CallArgs {
    let mut captured = CallArgs::new();
    for (param, value) in params.iter().zip(positional) {
        if scalar_value(value).is_some() {
            captured.insert(param.as_ref().to_string(), value.clone());
        }
    }
    for (key, value) in keyword {
        if scalar_value(value).is_some() {
            captured.insert(key.clone(), value.clone());
        }
    }
    captured
}

/// Creates traced functions and scoped spans on one tracer.
pub struct FnTracer<T = BoxedTracer> {
    tracer: Arc<T>,
}

impl<T> Clone for FnTracer<T> {
    fn clone(&self) -> Self {
        Self {
            tracer: self.tracer.clone(),
        }
    }
}

impl FnTracer<BoxedTracer> {
    /// Tracer from the global provider under the default scope.
    pub fn global() -> Self {
        Self::new(global::tracer(DEFAULT_SCOPE))
    }

    pub fn from_config(config: &InstrumentationConfig) -> Self {
        Self::new(global::tracer(static_scope(config.scope.clone())))
    }
}

impl<T> FnTracer<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    pub fn new(tracer: T) -> Self {
        Self {
            tracer: Arc::new(tracer),
        }
    }

    /// Wraps `f` in a span named after the function.
    ///
    /// Fails for closures and function pointers, which have no usable name;
    /// use [`FnTracer::trace_named`] for those.
    pub fn trace<F>(&self, f: F) -> Result<Traced<F, T>, TraceError> {
        let name = infer_span_name::<F>().ok_or_else(|| {
            TraceError::InvalidArguments(format!(
                "cannot infer a span name from `{}`, use trace_named",
                std::any::type_name::<F>()
            ))
        })?;
        Ok(self.traced(name, f))
    }

    /// Wraps `f` in a span with the given name.
    pub fn trace_named<F>(&self, name: impl Into<String>, f: F) -> Result<Traced<F, T>, TraceError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TraceError::InvalidArguments(
                "span name must not be empty".to_string(),
            ));
        }
        Ok(self.traced(name, f))
    }

    fn traced<F>(&self, name: String, f: F) -> Traced<F, T> {
        debug!(span_name = %name, "tracing function");
        Traced {
            name: Cow::Owned(name),
            params: Vec::new(),
            f,
            tracer: self.tracer.clone(),
        }
    }

    /// Starts a span that stays open until the returned scope is dropped.
    pub fn span(&self, name: impl Into<Cow<'static, str>>) -> SpanScope {
        SpanScope {
            cx: start_internal(&*self.tracer, name, Vec::new()).into_context(),
        }
    }
}

/// A function whose every call runs inside a span.
pub struct Traced<F, T = BoxedTracer> {
    name: Cow<'static, str>,
    params: Vec<String>,
    f: F,
    tracer: Arc<T>,
}

impl<F, T> Traced<F, T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter names used by [`Traced::call_with_args`].
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Calls the function inside a new span.
    pub fn call<Args>(&self, args: Args) -> <F as Callable<Args>>::Output
    where
        F: Callable<Args>,
    {
        self.call_inner(args, Vec::new())
    }

    /// Like [`Traced::call`], recording scalar arguments as span attributes
    /// under the names given to [`Traced::with_params`].
    pub fn call_with_args<Args>(&self, args: Args) -> <F as Callable<Args>>::Output
    where
        F: Callable<Args>,
        Args: Serialize,
    {
        let attributes = self.argument_attributes(&args);
        self.call_inner(args, attributes)
    }

    /// Awaits the returned future inside a new span.
    pub async fn call_async<Args, Fut>(&self, args: Args) -> Fut::Output
    where
        F: Callable<Args, Output = Fut>,
        Fut: Future,
    {
        self.call_async_inner(args, Vec::new()).await
    }

    pub async fn call_async_with_args<Args, Fut>(&self, args: Args) -> Fut::Output
    where
        F: Callable<Args, Output = Fut>,
        Fut: Future,
        Args: Serialize,
    {
        let attributes = self.argument_attributes(&args);
        self.call_async_inner(args, attributes).await
    }

    fn call_inner<Args>(&self, args: Args, attributes: Vec<KeyValue>) -> <F as Callable<Args>>::Output
    where
        F: Callable<Args>,
    {
        let span = start_internal(&*self.tracer, self.name.clone(), attributes);
        let output = {
            let _attached = span.context().clone().attach();
            self.f.invoke(args)
        };
        span.end();
        output
    }

    async fn call_async_inner<Args, Fut>(&self, args: Args, attributes: Vec<KeyValue>) -> Fut::Output
    where
        F: Callable<Args, Output = Fut>,
        Fut: Future,
    {
        let span = start_internal(&*self.tracer, self.name.clone(), attributes);
        let output = self
            .f
            .invoke(args)
            .with_context(span.context().clone())
            .await;
        span.end();
        output
    }

    fn argument_attributes<Args: Serialize>(&self, args: &Args) -> Vec<KeyValue> {
        let positional = match serde_json::to_value(args) {
            Ok(Value::Array(values)) => values,
            Ok(Value::Null) => Vec::new(),
            Ok(value) => vec![value],
            Err(e) => {
                debug!(span_name = %self.name, error = %e, "arguments not serializable, skipping capture");
                return Vec::new();
            }
        };
        capture_args(&self.params, &positional, &CallArgs::new())
            .into_iter()
            .filter_map(|(key, value)| scalar_value(&value).map(|value| KeyValue::new(key, value)))
            .collect()
    }
}

/// An open span, ended when the scope is dropped.
///
/// Use [`SpanScope::enter`] to make it current for synchronous code and
/// [`SpanScope::instrument`] to run a future inside it.
pub struct SpanScope {
    cx: Context,
}

impl SpanScope {
    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn set_attribute(&self, attribute: KeyValue) {
        self.cx.span().set_attribute(attribute);
    }

    /// Makes the span current until the returned guard is dropped.
    pub fn enter(&self) -> ContextGuard {
        self.cx.clone().attach()
    }

    pub async fn instrument<Fut: Future>(&self, future: Fut) -> Fut::Output {
        future.with_context(self.cx.clone()).await
    }
}

impl Drop for SpanScope {
    fn drop(&mut self) {
        self.cx.span().end();
    }
}
