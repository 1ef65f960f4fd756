//! Method table served over a connection.
//!
//! Handlers are bound with their arity fixed by the binding function, so an
//! ill-formed handler is a compile error and a duplicate name a bind error.
//! At call time only the argument count and argument types can still be wrong.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::message::{Call, Response};
use super::peer::Peer;
use crate::error::{BindError, RpcError};

type Handler<S> =
    Arc<dyn Fn(Arc<S>, Peer, Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

struct Method<S> {
    arity: usize,
    handler: Handler<S>,
}

pub struct Registry<S> {
    service: Arc<S>,
    methods: HashMap<String, Method<S>>,
}

impl<S: Send + Sync + 'static> Registry<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self {
            service,
            methods: HashMap::new(),
        }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Bind a handler that takes no arguments. The calling peer is passed so
    /// handlers can call back into the client that invoked them.
    pub fn bind0<F, Fut, T, E>(&mut self, name: &str, f: F) -> Result<(), BindError>
    where
        F: Fn(Arc<S>, Peer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + 'static,
        E: Display + 'static,
    {
        let handler: Handler<S> = Arc::new(move |service: Arc<S>, peer: Peer, _args: Vec<Value>| {
            let call = f(service, peer);
            async move { encode(call.await) }.boxed()
        });
        self.insert(name, 0, handler)
    }

    /// Bind a handler that takes exactly one argument.
    pub fn bind1<A, F, Fut, T, E>(&mut self, name: &str, f: F) -> Result<(), BindError>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(Arc<S>, Peer, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + 'static,
        E: Display + 'static,
    {
        let method = name.to_string();
        let handler: Handler<S> = Arc::new(move |service: Arc<S>, peer: Peer, mut args: Vec<Value>| {
            let arg = match args.pop().map(serde_json::from_value::<A>) {
                Some(Ok(arg)) => arg,
                Some(Err(e)) => {
                    let err = RpcError::Unprocessable {
                        name: method.clone(),
                        reason: e.to_string(),
                    };
                    return async move { Err(err) }.boxed();
                }
                None => {
                    let err = RpcError::Unprocessable {
                        name: method.clone(),
                        reason: "missing argument".into(),
                    };
                    return async move { Err(err) }.boxed();
                }
            };
            let call = f(service, peer, arg);
            async move { encode(call.await) }.boxed()
        });
        self.insert(name, 1, handler)
    }

    fn insert(&mut self, name: &str, arity: usize, handler: Handler<S>) -> Result<(), BindError> {
        if self.methods.contains_key(name) {
            return Err(BindError::Duplicate(name.to_string()));
        }
        self.methods.insert(name.to_string(), Method { arity, handler });
        Ok(())
    }

    /// Run `call` and build the response to send back. Never fails: every
    /// error ends up in the response envelope.
    pub async fn dispatch(&self, peer: Peer, call: Call) -> Response {
        debug!(peer = peer.id(), request_id = %call.request_id, name = %call.name, "dispatching call");

        let result = match self.methods.get(&call.name) {
            None => Err(RpcError::NotFound(call.name.clone())),
            Some(method) if method.arity != call.args.len() => Err(RpcError::Unprocessable {
                name: call.name.clone(),
                reason: format!("expected {} argument(s), got {}", method.arity, call.args.len()),
            }),
            Some(method) => (method.handler)(Arc::clone(&self.service), peer, call.args).await,
        };

        Response::from_result(call.request_id, result)
    }
}

fn encode<T: Serialize, E: Display>(result: Result<T, E>) -> Result<Value, RpcError> {
    match result {
        Ok(value) => Ok(serde_json::to_value(value)?),
        Err(e) => Err(RpcError::Handler(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Counter {
        value: AtomicUsize,
    }

    #[derive(Deserialize)]
    struct Step {
        by: usize,
    }

    fn registry() -> Registry<Counter> {
        let mut registry = Registry::new(Arc::new(Counter::default()));
        registry
            .bind0("Get", |counter: Arc<Counter>, _| async move {
                Ok::<_, RpcError>(counter.value.load(Ordering::SeqCst))
            })
            .unwrap();
        registry
            .bind1("Add", |counter: Arc<Counter>, _, step: Step| async move {
                counter.value.fetch_add(step.by, Ordering::SeqCst);
                Ok::<_, RpcError>(())
            })
            .unwrap();
        registry
            .bind0("Fail", |_, _| async move { Err::<(), _>("test error") })
            .unwrap();
        registry
    }

    fn peer() -> Peer {
        let (tx, _rx) = mpsc::unbounded_channel();
        Peer::new(0, tx)
    }

    fn call(id: &str, name: &str, args: Vec<Value>) -> Call {
        Call {
            request_id: id.into(),
            name: name.into(),
            args,
        }
    }

    #[tokio::test]
    async fn dispatches_typed_handlers() {
        let registry = registry();

        let added = registry.dispatch(peer(), call("1", "Add", vec![json!({"by": 3})])).await;
        assert_eq!(added.request_id, "1");
        assert_eq!(added.value, Value::Null);
        assert!(added.error.is_empty());

        let got = registry.dispatch(peer(), call("2", "Get", vec![])).await;
        assert_eq!(got.value, json!(3));
        assert!(got.error.is_empty());
    }

    #[tokio::test]
    async fn handler_errors_become_responses() {
        let response = registry().dispatch(peer(), call("3", "Fail", vec![])).await;

        assert_eq!(response.value, Value::Null);
        assert_eq!(response.error, "test error");
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        for id in ["a", "42", ""] {
            let response = registry().dispatch(peer(), call(id, "Missing", vec![])).await;

            assert_eq!(response.request_id, id);
            assert_eq!(response.value, Value::Null);
            assert!(response.error.contains("not found"));
        }
    }

    #[tokio::test]
    async fn wrong_arity_or_type_is_unprocessable() {
        let registry = registry();

        let too_many = registry.dispatch(peer(), call("1", "Get", vec![json!(1)])).await;
        let too_few = registry.dispatch(peer(), call("2", "Add", vec![])).await;
        let wrong_type = registry.dispatch(peer(), call("3", "Add", vec![json!("three")])).await;

        for response in [too_many, too_few, wrong_type] {
            assert_eq!(response.value, Value::Null);
            assert!(response.error.starts_with("unprocessable"), "{}", response.error);
        }
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let mut registry = registry();

        let err = registry
            .bind0("Get", |_, _| async move { Ok::<_, RpcError>(0) })
            .unwrap_err();

        assert!(matches!(err, BindError::Duplicate(name) if name == "Get"));
    }
}
