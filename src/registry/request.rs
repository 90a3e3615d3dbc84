use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{lock_ignore_poison, EventRegistry};
use crate::{Code, Envelope, Result};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased awaitable request handler.
///
/// Returning `Ok(None)` means "absent": no reply is sent even if the caller
/// supplied correlation and reply-to properties.
pub(crate) trait HandlerFn: Send + Sync {
    fn call(&self, envelope: Envelope) -> BoxFuture<'static, Result<Option<Value>>>;
}

// Typed handler adapter: decodes the envelope body into the handler's
// request type and serializes its reply back into a dynamic value.
struct Handler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<TResp>>> + Send,
    TReq: DeserializeOwned,
    TResp: Serialize,
{
    func: F,
    _phantom: PhantomData<fn(TReq, TResp, Fut)>,
}

impl<F, Fut, TReq, TResp> HandlerFn for Handler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<TResp>>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    fn call(&self, envelope: Envelope) -> BoxFuture<'static, Result<Option<Value>>> {
        // ---
        let req: TReq = match envelope.decode_body() {
            Ok(req) => req,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.func)(req);

        Box::pin(async move {
            match fut.await? {
                Some(resp) => Ok(Some(serde_json::to_value(resp)?)),
                None => Ok(None),
            }
        })
    }
}

// Raw handler adapter: receives the whole envelope, returns a dynamic value.
struct RawHandler<F, Fut>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>>> + Send,
{
    func: F,
    _phantom: PhantomData<fn(Fut)>,
}

impl<F, Fut> HandlerFn for RawHandler<F, Fut>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    fn call(&self, envelope: Envelope) -> BoxFuture<'static, Result<Option<Value>>> {
        // ---
        Box::pin((self.func)(envelope))
    }
}

/// Registry binding at most one awaited request handler per code.
///
/// Extends the event-registry capability: event callbacks registered here
/// share this registry's interest set with its request handlers.
#[derive(Default)]
pub struct RequestRegistry {
    // ---
    events: EventRegistry,
    handlers: Mutex<HashMap<Code, Arc<dyn HandlerFn>>>,
}

impl RequestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a fire-and-forget event callback for `code`.
    pub fn on(&self, code: impl Into<Code>, callback: impl Fn(Envelope) + Send + Sync + 'static) {
        // ---
        self.events.on(code, callback);
    }

    /// Bind a typed request handler for `code`.
    ///
    /// The handler receives the decoded request body and returns either a
    /// reply payload or `None`, meaning no reply should be sent. Binding
    /// the same code twice replaces the earlier handler.
    pub fn on_request<F, Fut, TReq, TResp>(&self, code: impl Into<Code>, handler: F)
    where
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<TResp>>> + Send + 'static,
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
    {
        // ---
        let mut handlers = lock_ignore_poison(&self.handlers);
        handlers.insert(
            code.into(),
            Arc::new(Handler {
                func: handler,
                _phantom: PhantomData,
            }),
        );
    }

    /// Bind an untyped request handler that receives the whole envelope.
    pub fn on_request_raw<F, Fut>(&self, code: impl Into<Code>, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        // ---
        let mut handlers = lock_ignore_poison(&self.handlers);
        handlers.insert(
            code.into(),
            Arc::new(RawHandler {
                func: handler,
                _phantom: PhantomData,
            }),
        );
    }

    /// Union of event and request codes registered here.
    pub fn codes(&self) -> Vec<Code> {
        // ---
        let mut codes = self.events.codes();

        let handlers = lock_ignore_poison(&self.handlers);
        for code in handlers.keys() {
            if !codes.contains(code) {
                codes.push(code.clone());
            }
        }

        codes
    }

    /// Look up and await the handler bound to `code`.
    ///
    /// An unbound code is absent, not an error.
    pub(crate) async fn handle(&self, code: &Code, envelope: &Envelope) -> Result<Option<Value>> {
        // ---
        let handler = {
            let handlers = lock_ignore_poison(&self.handlers);
            handlers.get(code).cloned()
        };

        match handler {
            Some(handler) => handler.call(envelope.clone()).await,
            None => Ok(None),
        }
    }

    /// Invoke the event callback bound to `code`, if any.
    pub(crate) fn notify(&self, code: &Code, envelope: &Envelope) {
        // ---
        self.events.notify(code, envelope);
    }
}
