//! Consumer-side event handlers.
//!
//! A handler declares the event type it processes and receives the raw payload
//! of every message of that type. Handlers run under at-least-once delivery: a
//! failed handler invocation leaves the message uncommitted and it is delivered
//! again, so every handler must be safe to run more than once for the same event.
//!
//! # Example
//!
//! ```
//! use ledger_events_core::account::AccountCreated;
//! use ledger_events_core::handler::{EventHandler, TypedHandler};
//!
//! let handler = TypedHandler::new(|_ctx, event: AccountCreated| async move {
//!     println!("welcome {}", event.name);
//!     Ok(())
//! });
//! assert_eq!(handler.event_type(), "AccountCreated");
//! ```

use crate::event::DomainEvent;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors returned by handlers.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The payload could not be decoded into the handler's event type.
    #[error("Failed to decode {event_type} payload: {reason}")]
    Decode {
        /// Event type being decoded.
        event_type: String,
        /// Decoder message.
        reason: String,
    },

    /// The handler's own processing failed.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// Processing was abandoned because the consumer is shutting down.
    #[error("Handler cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::Failed`].
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

/// Per-message context handed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Event type the message was dispatched under.
    pub event_type: String,
    /// Topic the message was read from.
    pub topic: String,
    /// Partition of the message.
    pub partition: i32,
    /// Offset of the message.
    pub offset: i64,
    /// Partition key (aggregate id), if present.
    pub key: Option<String>,
    /// Cancelled when the consumer is asked to stop, through its run token or
    /// `stop`. The consumer still waits for the handler to return.
    pub cancellation: CancellationToken,
}

/// Processes payloads of one event type.
///
/// # Thread Safety
///
/// Implementors must be `Send + Sync + 'static` because the consumer shares them
/// across its run loop.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// The event type this handler processes.
    fn event_type(&self) -> &str;

    /// Handle one raw payload.
    ///
    /// # Errors
    ///
    /// Any error leaves the message uncommitted so it is redelivered.
    async fn handle(&self, ctx: &HandlerContext, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Handler that decodes the payload into `E` before calling a closure.
///
/// The event type is taken from `E::EVENT_TYPE`, so the registration key can
/// never drift from the decoded type.
pub struct TypedHandler<E, F> {
    handle: F,
    _event: PhantomData<fn() -> E>,
}

impl<E, F, Fut> TypedHandler<E, F>
where
    E: DomainEvent,
    F: Fn(HandlerContext, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    /// Wrap a closure handling decoded `E` events.
    pub const fn new(handle: F) -> Self {
        Self {
            handle,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler for TypedHandler<E, F>
where
    E: DomainEvent,
    F: Fn(HandlerContext, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn event_type(&self) -> &str {
        E::EVENT_TYPE
    }

    async fn handle(&self, ctx: &HandlerContext, payload: &[u8]) -> Result<(), HandlerError> {
        let event = E::from_payload(payload).map_err(|e| HandlerError::Decode {
            event_type: E::EVENT_TYPE.to_string(),
            reason: e.to_string(),
        })?;
        (self.handle)(ctx.clone(), event).await
    }
}
