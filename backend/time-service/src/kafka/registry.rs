//! Event kind to handler mapping
//!
//! The registry is shared between the consumer and the consume task. Lookups
//! clone the handler `Arc` out of the lock, so a handler never runs while the
//! lock is held and registration stays possible during consumption.

use async_trait::async_trait;
use event_schema::{EventEnvelope, EventKind, EventPayload};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload does not match {kind}: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage rejected {0} event")]
    Storage(EventKind),

    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler panicked")]
    Panicked,
}

/// Processes one decoded envelope
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Handler over the raw envelope, built by [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync,
{
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        (self.f)(envelope.clone()).await
    }
}

/// Wrap an async closure over the raw envelope
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: move |envelope: EventEnvelope| -> BoxFuture<'static, Result<(), HandlerError>> {
            Box::pin(f(envelope))
        },
    })
}

/// Handler that decodes `data` into `P` before calling the closure
pub struct TypedHandler<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> EventHandler for TypedHandler<P, F>
where
    P: EventPayload + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let payload: P = envelope
            .decode_data()
            .map_err(|source| HandlerError::Payload {
                kind: envelope.event_type.clone(),
                source,
            })?;
        (self.f)(payload).await
    }
}

/// Wrap an async closure over a typed payload. A `data` object that does not
/// fit `P` fails with [`HandlerError::Payload`].
pub fn typed_handler<P, F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    P: EventPayload + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _payload: PhantomData,
    })
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<EventKind, Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one
    pub fn register(&self, kind: impl Into<EventKind>, handler: Arc<dyn EventHandler>) {
        self.handlers.write().insert(kind.into(), handler);
    }

    /// Register a typed handler under its payload's kind
    pub fn register_typed<P, F, Fut>(&self, f: F)
    where
        P: EventPayload + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(P::kind(), typed_handler::<P, F, Fut>(f));
    }

    pub fn unregister(&self, kind: &EventKind) {
        self.handlers.write().remove(kind);
    }

    pub fn get(&self, kind: &EventKind) -> Option<Arc<dyn EventHandler>> {
        self.handlers.read().get(kind).cloned()
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.handlers.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
