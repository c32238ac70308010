//! Per-connection dispatch table and middleware chain.
//!
//! Precedence for every inbound frame, first match wins:
//!
//! 1. pre-decode middleware (may veto)
//! 2. raw handler (consumes the frame verbatim)
//! 3. envelope decode (`{type, data, extra}`, empty type rejected)
//! 4. type middleware (may veto)
//! 5. typed handler for `type`
//! 6. otherwise the frame is unhandled

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use switchboard_core::update::decode_data;
use switchboard_core::{BoxError, ConnectionError, Update};

/// Handler bound to one update type.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    /// Decode the envelope's payload and run the handler.
    ///
    /// Decode failures are [`ConnectionError::Decode`]; failures of the
    /// handler itself are [`ConnectionError::Handler`].
    async fn handle(&self, update: Update) -> Result<(), ConnectionError>;
}

/// Adapts an async function over a deserializable input into an [`UpdateHandler`].
pub struct TypedHandler<T, F> {
    func: F,
    _input: PhantomData<fn() -> T>,
}

impl<T, F> TypedHandler<T, F> {
    /// Wrap `func`.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _input: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut, E> UpdateHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn handle(&self, update: Update) -> Result<(), ConnectionError> {
        let Update {
            update_type, data, ..
        } = update;
        let input: T = decode_data(data)?;
        (self.func)(input)
            .await
            .map_err(|e| ConnectionError::handler(update_type, e))
    }
}

/// Raw handler: receives every frame verbatim.
pub type RawHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Pre-decode middleware over the raw frame.
pub type Middleware = Arc<dyn Fn(&[u8]) -> Result<(), BoxError> + Send + Sync>;

/// Post-decode middleware over the update type and undecoded payload.
pub type TypeMiddleware = Arc<dyn Fn(&str, Option<&Value>) -> Result<(), BoxError> + Send + Sync>;

/// Result of dispatching one frame.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// A raw or typed handler consumed the frame.
    Handled,
    /// No handler matched.
    Unhandled(Update),
}

/// Handler slots of one connection, each under its own lock.
///
/// Once sealed (on close) every slot is emptied and further registrations
/// are ignored, so no handler closure outlives the connection.
#[derive(Default)]
pub(crate) struct HandlerTable {
    typed: RwLock<HashMap<String, Arc<dyn UpdateHandler>>>,
    raw: Mutex<Option<RawHandler>>,
    middleware: Mutex<Option<Middleware>>,
    type_middleware: Mutex<Option<TypeMiddleware>>,
    sealed: AtomicBool,
}

impl HandlerTable {
    fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_typed(&self, update_type: String, handler: Arc<dyn UpdateHandler>) -> bool {
        let mut typed = self.typed.write();
        if self.is_sealed() {
            return false;
        }
        let _ = typed.insert(update_type, handler);
        true
    }

    pub(crate) fn remove_typed(&self, update_type: &str) -> bool {
        self.typed.write().remove(update_type).is_some()
    }

    pub(crate) fn has_typed(&self, update_type: &str) -> bool {
        self.typed.read().contains_key(update_type)
    }

    pub(crate) fn set_raw(&self, handler: Option<RawHandler>) -> bool {
        Self::set_slot(&self.raw, handler, &self.sealed)
    }

    pub(crate) fn set_middleware(&self, middleware: Option<Middleware>) -> bool {
        Self::set_slot(&self.middleware, middleware, &self.sealed)
    }

    pub(crate) fn set_type_middleware(&self, middleware: Option<TypeMiddleware>) -> bool {
        Self::set_slot(&self.type_middleware, middleware, &self.sealed)
    }

    fn set_slot<H>(slot: &Mutex<Option<H>>, value: Option<H>, sealed: &AtomicBool) -> bool {
        let mut slot = slot.lock();
        if value.is_some() && sealed.load(Ordering::SeqCst) {
            return false;
        }
        *slot = value;
        true
    }

    /// Empty every slot and refuse further registrations.
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        self.typed.write().clear();
        *self.raw.lock() = None;
        *self.middleware.lock() = None;
        *self.type_middleware.lock() = None;
    }

    /// Run one frame through the chain.
    ///
    /// Handlers are cloned out of their slots before being awaited, so
    /// registration never waits on a running handler.
    pub(crate) async fn dispatch(&self, frame: &Bytes) -> Result<Dispatch, ConnectionError> {
        let middleware = self.middleware.lock().clone();
        if let Some(middleware) = middleware {
            middleware(&frame[..]).map_err(ConnectionError::Middleware)?;
        }

        let raw = self.raw.lock().clone();
        if let Some(raw) = raw {
            raw(frame.clone())
                .await
                .map_err(|e| ConnectionError::handler("", e))?;
            return Ok(Dispatch::Handled);
        }

        let update = Update::parse(frame)?;

        let type_middleware = self.type_middleware.lock().clone();
        if let Some(type_middleware) = type_middleware {
            type_middleware(&update.update_type, update.data.as_ref())
                .map_err(ConnectionError::Middleware)?;
        }

        let handler = self.typed.read().get(&update.update_type).cloned();
        match handler {
            Some(handler) => {
                handler.handle(update).await?;
                Ok(Dispatch::Handled)
            }
            None => Ok(Dispatch::Unhandled(update)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use serde::Deserialize;
    use switchboard_core::{EmptyInput, ErrorCategory};

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Point {
        x: i64,
    }

    fn counting_handler<T>(hits: Arc<AtomicUsize>) -> Arc<dyn UpdateHandler>
    where
        T: DeserializeOwned + Send + 'static,
    {
        Arc::new(TypedHandler::new(move |_: T| {
            let hits = hits.clone();
            async move {
                let _ = hits.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        }))
    }

    fn frame(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn typed_handler_receives_decoded_data() {
        let table = HandlerTable::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let handler = TypedHandler::new(move |p: Point| {
            let seen = seen2.clone();
            async move {
                seen.store(usize::try_from(p.x).unwrap_or_default(), Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        });
        assert!(table.set_typed("MOVE".into(), Arc::new(handler)));

        let outcome = table.dispatch(&frame(r#"{"type":"MOVE","data":{"x":7}}"#)).await;
        assert_matches!(outcome, Ok(Dispatch::Handled));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn empty_type_never_reaches_handlers() {
        let table = HandlerTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let _ = table.set_typed(String::new(), counting_handler::<EmptyInput>(hits.clone()));

        let outcome = table.dispatch(&frame(r#"{"data":{"x":1}}"#)).await;
        assert_matches!(outcome, Err(ConnectionError::EmptyUpdateType));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_envelope_is_a_protocol_error() {
        let table = HandlerTable::default();
        let err = table.dispatch(&frame("not json")).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }

    #[tokio::test]
    async fn payload_shape_mismatch_is_a_decode_error() {
        let table = HandlerTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let _ = table.set_typed("MOVE".into(), counting_handler::<Point>(hits.clone()));

        let outcome = table.dispatch(&frame(r#"{"type":"MOVE","data":"nope"}"#)).await;
        assert_matches!(outcome, Err(ConnectionError::Decode(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_input_skips_payload_inspection() {
        let table = HandlerTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let _ = table.set_typed("PING".into(), counting_handler::<EmptyInput>(hits.clone()));

        for body in [
            r#"{"type":"PING"}"#,
            r#"{"type":"PING","data":{}}"#,
            r#"{"type":"PING","data":[1,2,3]}"#,
        ] {
            assert_matches!(table.dispatch(&frame(body)).await, Ok(Dispatch::Handled));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn handler_error_is_attributed_to_its_type() {
        let table = HandlerTable::default();
        let handler = TypedHandler::new(|_: EmptyInput| async { Err::<(), _>("boom") });
        let _ = table.set_typed("FAIL".into(), Arc::new(handler));

        let err = table.dispatch(&frame(r#"{"type":"FAIL"}"#)).await.unwrap_err();
        assert_matches!(&err, ConnectionError::Handler { update_type, .. } if update_type == "FAIL");
        assert_eq!(err.category(), ErrorCategory::Application);
    }

    #[tokio::test]
    async fn unmatched_type_is_unhandled() {
        let table = HandlerTable::default();
        let outcome = table.dispatch(&frame(r#"{"type":"OTHER","extra":"e"}"#)).await;
        assert_matches!(outcome, Ok(Dispatch::Unhandled(u)) if u.update_type == "OTHER" && u.extra.as_deref() == Some("e"));
    }

    #[tokio::test]
    async fn failing_pre_middleware_drops_everything() {
        let table = HandlerTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let _ = table.set_typed("PING".into(), counting_handler::<EmptyInput>(hits.clone()));
        let _ = table.set_middleware(Some(Arc::new(|_: &[u8]| -> Result<(), BoxError> {
            Err("denied".into())
        })));

        for body in [r#"{"type":"PING"}"#, "garbage", r#"{"data":1}"#] {
            assert_matches!(
                table.dispatch(&frame(body)).await,
                Err(ConnectionError::Middleware(_))
            );
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn raw_handler_bypasses_decode() {
        let table = HandlerTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let _ = table.set_typed("PING".into(), counting_handler::<EmptyInput>(hits.clone()));
        let raw_hits = Arc::new(AtomicUsize::new(0));
        let raw_hits2 = raw_hits.clone();
        let raw: RawHandler = Arc::new(move |_frame: Bytes| -> BoxFuture<'static, Result<(), BoxError>> {
            let raw_hits = raw_hits2.clone();
            Box::pin(async move {
                let _ = raw_hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let _ = table.set_raw(Some(raw));

        assert_matches!(table.dispatch(&frame("not json at all")).await, Ok(Dispatch::Handled));
        assert_matches!(table.dispatch(&frame(r#"{"type":"PING"}"#)).await, Ok(Dispatch::Handled));
        assert_eq!(raw_hits.load(Ordering::SeqCst), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let _ = table.set_raw(None);
        assert_matches!(table.dispatch(&frame(r#"{"type":"PING"}"#)).await, Ok(Dispatch::Handled));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn type_middleware_sees_type_and_raw_payload() {
        let table = HandlerTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let _ = table.set_typed("SECRET".into(), counting_handler::<EmptyInput>(hits.clone()));
        let _ = table.set_type_middleware(Some(Arc::new(
            |update_type: &str, data: Option<&Value>| -> Result<(), BoxError> {
                if update_type == "SECRET" && data.is_none_or(|d| d.get("token").is_none()) {
                    return Err("missing token".into());
                }
                Ok(())
            },
        )));

        assert_matches!(
            table.dispatch(&frame(r#"{"type":"SECRET"}"#)).await,
            Err(ConnectionError::Middleware(_))
        );
        assert_matches!(
            table.dispatch(&frame(r#"{"type":"SECRET","data":{"token":"t"}}"#)).await,
            Ok(Dispatch::Handled)
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reregistration_replaces_handler() {
        let table = HandlerTable::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let _ = table.set_typed("T".into(), counting_handler::<EmptyInput>(first.clone()));
        let _ = table.set_typed("T".into(), counting_handler::<EmptyInput>(second.clone()));

        let _ = table.dispatch(&frame(r#"{"type":"T"}"#)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sealed_table_refuses_registration() {
        let table = HandlerTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(table.set_typed("A".into(), counting_handler::<EmptyInput>(hits.clone())));
        table.seal();
        assert!(!table.has_typed("A"));
        assert!(!table.set_typed("B".into(), counting_handler::<EmptyInput>(hits)));
        assert!(!table.set_middleware(Some(Arc::new(|_: &[u8]| -> Result<(), BoxError> { Ok(()) }))));
        assert!(table.set_middleware(None));
    }
}
