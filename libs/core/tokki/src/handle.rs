//! Typed handles over a [`Service`].
//!
//! `Worker<P>` and `Publisher<P>` fix the payload type at the call site. Any
//! number of handles may point at the same service.

use crate::error::Result;
use crate::kind::SendOptions;
use crate::schema::{JsonSchema, Schema};
use crate::service::Service;
use crate::task::TaskHandler;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Bounds every payload type has to meet.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Point-to-point queue with priorities.
pub struct Worker<P> {
    service: Arc<Service>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Payload> Worker<P> {
    pub(crate) fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            _payload: PhantomData,
        }
    }

    /// Queue a task with the default priority.
    pub async fn send(&self, payload: &P) -> Result<()> {
        self.service.send(payload, SendOptions::default()).await
    }

    /// Queue a task, e.g. with `SendOptions::with_priority(10)`.
    pub async fn send_with(&self, payload: &P, options: SendOptions) -> Result<()> {
        self.service.send(payload, options).await
    }

    pub async fn set_consumer<H: TaskHandler<P>>(&self, handler: H) -> Result<()> {
        self.service
            .set_consumer(handler, JsonSchema::<P>::new())
            .await
    }

    pub async fn set_consumer_with_schema<H, S>(&self, handler: H, schema: S) -> Result<()>
    where
        H: TaskHandler<P>,
        S: Schema<P> + 'static,
    {
        self.service.set_consumer(handler, schema).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.service.cancel().await
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }
}

/// Fanout exchange; every consumer receives every message.
pub struct Publisher<P> {
    service: Arc<Service>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Payload> Publisher<P> {
    pub(crate) fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            _payload: PhantomData,
        }
    }

    pub async fn send(&self, payload: &P) -> Result<()> {
        self.service.send(payload, SendOptions::default()).await
    }

    pub async fn set_consumer<H: TaskHandler<P>>(&self, handler: H) -> Result<()> {
        self.service
            .set_consumer(handler, JsonSchema::<P>::new())
            .await
    }

    pub async fn set_consumer_with_schema<H, S>(&self, handler: H, schema: S) -> Result<()>
    where
        H: TaskHandler<P>,
        S: Schema<P> + 'static,
    {
        self.service.set_consumer(handler, schema).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.service.cancel().await
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }
}

impl<P> Clone for Worker<P> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> Clone for Publisher<P> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for Worker<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Worker").field(&self.service.id()).finish()
    }
}

impl<P> std::fmt::Debug for Publisher<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Publisher").field(&self.service.id()).finish()
    }
}
