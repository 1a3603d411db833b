//! Call surface of an OpenAI client
//!
//! Every operation (chat completion, completion, embedding) is reachable
//! through a blocking `create` slot and an async `acreate` slot. Slots hold
//! the implementation currently in effect and can be swapped at runtime,
//! which is how [`crate::OpenAIInstrumentor`] installs and removes its
//! decorators.

use crate::attributes::CallArgs;
use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Chunks of a streamed blocking call.
pub type ChunkIter = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Chunks of a streamed async call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Result of a blocking call.
pub enum Reply {
    Complete(Value),
    Stream(ChunkIter),
}

/// Result of an async call.
pub enum AsyncReply {
    Complete(Value),
    Stream(ChunkStream),
}

impl Reply {
    pub fn into_complete(self) -> Option<Value> {
        match self {
            Reply::Complete(value) => Some(value),
            Reply::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<ChunkIter> {
        match self {
            Reply::Stream(chunks) => Some(chunks),
            Reply::Complete(_) => None,
        }
    }
}

impl AsyncReply {
    pub fn into_complete(self) -> Option<Value> {
        match self {
            AsyncReply::Complete(value) => Some(value),
            AsyncReply::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<ChunkStream> {
        match self {
            AsyncReply::Stream(chunks) => Some(chunks),
            AsyncReply::Complete(_) => None,
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Complete(value) => f.debug_tuple("Complete").field(value).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl fmt::Debug for AsyncReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncReply::Complete(value) => f.debug_tuple("Complete").field(value).finish(),
            AsyncReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Whether the caller asked for a streamed response (`"stream": true`).
pub fn is_streaming(args: &CallArgs) -> bool {
    args.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

/// The kinds of call an OpenAI client exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallKind {
    ChatCompletion,
    Completion,
    Embedding,
}

impl CallKind {
    pub const ALL: [CallKind; 3] = [
        CallKind::ChatCompletion,
        CallKind::Completion,
        CallKind::Embedding,
    ];

    /// Resource name used in qualified names.
    pub fn resource(self) -> &'static str {
        match self {
            CallKind::ChatCompletion => "ChatCompletion",
            CallKind::Completion => "Completion",
            CallKind::Embedding => "Embedding",
        }
    }

    /// Value of the `gen_ai.operation.name` attribute.
    pub fn operation(self) -> &'static str {
        match self {
            CallKind::ChatCompletion => "chat",
            CallKind::Completion => "completion",
            CallKind::Embedding => "embedding",
        }
    }

    /// REST path relative to the API base.
    pub fn path(self) -> &'static str {
        match self {
            CallKind::ChatCompletion => "chat/completions",
            CallKind::Completion => "completions",
            CallKind::Embedding => "embeddings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mode {
    Blocking,
    Async,
}

impl Mode {
    pub fn method(self) -> &'static str {
        match self {
            Mode::Blocking => "create",
            Mode::Async => "acreate",
        }
    }
}

/// One instrumentable call site, e.g. `ChatCompletion.acreate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub kind: CallKind,
    pub mode: Mode,
}

impl Target {
    pub fn new(kind: CallKind, mode: Mode) -> Self {
        Self { kind, mode }
    }

    pub fn blocking(kind: CallKind) -> Self {
        Self::new(kind, Mode::Blocking)
    }

    pub fn nonblocking(kind: CallKind) -> Self {
        Self::new(kind, Mode::Async)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.kind.resource(), self.mode.method())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.resource(), self.mode.method())
    }
}

/// Blocking call implementation.
pub trait Create: Send + Sync {
    fn create(&self, args: &CallArgs) -> Result<Reply>;
}

impl<F> Create for F
where
    F: Fn(&CallArgs) -> Result<Reply> + Send + Sync,
{
    fn create(&self, args: &CallArgs) -> Result<Reply> {
        self(args)
    }
}

/// Async call implementation.
#[async_trait]
pub trait AsyncCreate: Send + Sync {
    async fn acreate(&self, args: &CallArgs) -> Result<AsyncReply>;
}

/// A swappable reference to the implementation behind one call site.
pub struct CallSlot<C: ?Sized> {
    current: RwLock<Arc<C>>,
}

impl<C: ?Sized> CallSlot<C> {
    pub fn new(implementation: Arc<C>) -> Self {
        Self {
            current: RwLock::new(implementation),
        }
    }

    /// The implementation currently in effect.
    pub fn get(&self) -> Arc<C> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs `implementation` and returns the one it replaced.
    pub fn replace(&self, implementation: Arc<C>) -> Arc<C> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, implementation)
    }
}

/// The blocking and async call slots of one kind of call.
pub struct ApiResource {
    kind: CallKind,
    create: CallSlot<dyn Create>,
    acreate: CallSlot<dyn AsyncCreate>,
}

impl ApiResource {
    pub fn new(kind: CallKind, create: Arc<dyn Create>, acreate: Arc<dyn AsyncCreate>) -> Self {
        Self {
            kind,
            create: CallSlot::new(create),
            acreate: CallSlot::new(acreate),
        }
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn create(&self, args: &CallArgs) -> Result<Reply> {
        self.create.get().create(args)
    }

    pub async fn acreate(&self, args: &CallArgs) -> Result<AsyncReply> {
        let implementation = self.acreate.get();
        implementation.acreate(args).await
    }

    pub fn create_slot(&self) -> &CallSlot<dyn Create> {
        &self.create
    }

    pub fn acreate_slot(&self) -> &CallSlot<dyn AsyncCreate> {
        &self.acreate
    }
}

/// An OpenAI client namespace: chat completions, completions and embeddings.
pub struct OpenAIClient {
    id: u64,
    pub chat_completion: ApiResource,
    pub completion: ApiResource,
    pub embedding: ApiResource,
}

impl OpenAIClient {
    pub fn new(
        chat_completion: ApiResource,
        completion: ApiResource,
        embedding: ApiResource,
    ) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        debug_assert_eq!(chat_completion.kind(), CallKind::ChatCompletion);
        debug_assert_eq!(completion.kind(), CallKind::Completion);
        debug_assert_eq!(embedding.kind(), CallKind::Embedding);

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            chat_completion,
            completion,
            embedding,
        }
    }

    /// Identity of this client, stable for its lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resource(&self, kind: CallKind) -> &ApiResource {
        match kind {
            CallKind::ChatCompletion => &self.chat_completion,
            CallKind::Completion => &self.completion,
            CallKind::Embedding => &self.embedding,
        }
    }
}
