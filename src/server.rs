//! Service binder and server-side call handling.
//!
//! Methods are bound explicitly by full name (no runtime reflection): a
//! [`ServiceBuilder`] collects `{name, call shape, handler}` entries and
//! builds the [`ServiceRegistry`] a server connection dispatches from.
//! Method full-names follow the `"/{package.Service}/{Method}"` format.
//!
//! # Example
//!
//! ```ignore
//! let services = ServiceBuilder::new()
//!     .unary("/svc/echo", |text: String, _ctx| async move { Ok(text) })
//!     .server_streaming("/svc/count", |n: u32, out: Responder<u32>, _ctx| async move {
//!         for i in 0..n {
//!             out.send(&i).await?;
//!         }
//!         Ok(())
//!     })
//!     .build();
//! let connection = Connection::server(transport, services, Default::default());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::codec::MsgPackCodec;
use crate::connection::ConnectionInner;
use crate::status::{Status, StatusCode};
use crate::stream::{MethodType, RpcStream, StreamReceivers};

/// Result type for handler functions.
pub type HandlerResult = std::result::Result<(), Status>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for bound method handlers.
pub trait Handler: Send + Sync + 'static {
    /// Handle one accepted call.
    fn call(&self, call: ServerCall) -> BoxFuture<'static, HandlerResult>;
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, call: ServerCall) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.0)(call))
    }
}

/// Ambient information about an accepted call.
///
/// Cheaply cloneable; handlers keep one to observe cancellation from
/// spawned subtasks.
#[derive(Clone)]
pub struct ServerContext {
    stream: Arc<RpcStream>,
    deadline: Option<Instant>,
}

impl ServerContext {
    /// Method full-name this call was opened for.
    pub fn method(&self) -> &str {
        self.stream.method()
    }

    /// Call shape of the bound method.
    pub fn method_type(&self) -> MethodType {
        self.stream.method_type()
    }

    /// Subscribe to the call's cancellation signal.
    ///
    /// Fires on peer cancel, client disconnect, and connection teardown.
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.stream.cancellation()
    }

    /// Whether the call has already been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.stream.cancellation().borrow()
    }

    /// Deadline for this call, if the host supplied one.
    ///
    /// `NewStream` carries only the method name, so no deadline crosses
    /// the wire; elapsed client deadlines surface as cancellation instead.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// One accepted call, handed to the bound handler.
///
/// Carries the inbound message receiver and the outbound sender for the
/// stream; raw handlers drive it directly, typed handlers go through
/// [`Requests`]/[`Responder`].
pub struct ServerCall {
    context: ServerContext,
    messages: mpsc::UnboundedReceiver<Bytes>,
}

impl ServerCall {
    fn new(stream: Arc<RpcStream>, receivers: StreamReceivers) -> Self {
        Self {
            context: ServerContext {
                stream,
                deadline: None,
            },
            messages: receivers.messages,
        }
    }

    /// Ambient call context.
    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    /// Method full-name this call was opened for.
    pub fn method(&self) -> &str {
        self.context.method()
    }

    /// Deadline for this call, if the host supplied one.
    pub fn deadline(&self) -> Option<Instant> {
        self.context.deadline()
    }

    /// Receive the next request message; `None` once the client half is
    /// closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.messages.recv().await
    }

    /// Typed receive through the MsgPack codec.
    pub async fn recv_msgpack<T: DeserializeOwned>(&mut self) -> std::result::Result<Option<T>, Status> {
        match self.messages.recv().await {
            Some(bytes) => MsgPackCodec::decode(&bytes)
                .map(Some)
                .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string())),
            None => Ok(None),
        }
    }

    /// Send one response message.
    pub async fn send(&self, message: Bytes) -> std::result::Result<(), Status> {
        self.context
            .stream
            .send_message(message, false)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))
    }

    /// Send the final response message (half-closes before the trailer).
    pub async fn send_last(&self, message: Bytes) -> std::result::Result<(), Status> {
        self.context
            .stream
            .send_message(message, true)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))
    }

    /// Split into the typed request/response halves.
    pub fn split_typed<Req, Res>(self) -> (Requests<Req>, Responder<Res>, ServerContext)
    where
        Req: DeserializeOwned,
        Res: Serialize,
    {
        let context = self.context.clone();
        (
            Requests {
                messages: self.messages,
                _marker: PhantomData,
            },
            Responder {
                context: self.context,
                _marker: PhantomData,
            },
            context,
        )
    }
}

/// Typed inbound request stream.
pub struct Requests<T> {
    messages: mpsc::UnboundedReceiver<Bytes>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Requests<T> {
    /// Next request message; `None` once the client half is closed.
    pub async fn next(&mut self) -> std::result::Result<Option<T>, Status> {
        match self.messages.recv().await {
            Some(bytes) => MsgPackCodec::decode(&bytes)
                .map(Some)
                .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string())),
            None => Ok(None),
        }
    }
}

/// Typed outbound response sender.
pub struct Responder<T> {
    context: ServerContext,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> Responder<T> {
    /// Send one response message.
    pub async fn send(&self, message: &T) -> std::result::Result<(), Status> {
        let payload = MsgPackCodec::encode(message).map_err(|e| Status::unknown(e.to_string()))?;
        self.context
            .stream
            .send_message(Bytes::from(payload), false)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))
    }

    /// Send the final response message.
    pub async fn send_last(&self, message: &T) -> std::result::Result<(), Status> {
        let payload = MsgPackCodec::encode(message).map_err(|e| Status::unknown(e.to_string()))?;
        self.context
            .stream
            .send_message(Bytes::from(payload), true)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))
    }
}

/// Entry for a bound method.
pub(crate) struct MethodEntry {
    pub(crate) method_type: MethodType,
    handler: Box<dyn Handler>,
}

/// Builder collecting method bindings.
pub struct ServiceBuilder {
    methods: HashMap<String, Arc<MethodEntry>>,
}

impl ServiceBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    fn register(mut self, name: &str, method_type: MethodType, handler: impl Handler) -> Self {
        self.methods.insert(
            name.to_string(),
            Arc::new(MethodEntry {
                method_type,
                handler: Box::new(handler),
            }),
        );
        self
    }

    /// Bind a raw `Bytes`-level handler.
    pub fn raw<F, Fut>(self, name: &str, method_type: MethodType, handler: F) -> Self
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, method_type, FnHandler(handler))
    }

    /// Bind a unary method: one request in, one response out.
    pub fn unary<Req, Res, F, Fut>(self, name: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Req, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Res, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.raw(name, MethodType::Unary, move |mut call: ServerCall| {
            let handler = handler.clone();
            async move {
                let context = call.context().clone();
                let Some(request) = call.recv().await else {
                    return Err(Status::new(
                        StatusCode::InvalidArgument,
                        "request message missing",
                    ));
                };
                let request: Req = MsgPackCodec::decode(&request)
                    .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string()))?;

                let response = handler(request, context).await?;

                let payload =
                    MsgPackCodec::encode(&response).map_err(|e| Status::unknown(e.to_string()))?;
                call.send_last(Bytes::from(payload)).await
            }
        })
    }

    /// Bind a client-streaming method: many requests in, one response out.
    pub fn client_streaming<Req, Res, F, Fut>(self, name: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + Sync + 'static,
        F: Fn(Requests<Req>, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Res, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.raw(name, MethodType::ClientStreaming, move |call: ServerCall| {
            let handler = handler.clone();
            async move {
                let (requests, responder, context) = call.split_typed::<Req, Res>();
                let response = handler(requests, context).await?;
                responder.send_last(&response).await
            }
        })
    }

    /// Bind a server-streaming method: one request in, many responses out.
    pub fn server_streaming<Req, Res, F, Fut>(self, name: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Req, Responder<Res>, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.raw(name, MethodType::ServerStreaming, move |call: ServerCall| {
            let handler = handler.clone();
            async move {
                let (mut requests, responder, context) = call.split_typed::<Req, Res>();
                let Some(request) = requests.next().await? else {
                    return Err(Status::new(
                        StatusCode::InvalidArgument,
                        "request message missing",
                    ));
                };
                handler(request, responder, context).await
            }
        })
    }

    /// Bind a duplex method: both halves stream independently.
    pub fn duplex<Req, Res, F, Fut>(self, name: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Requests<Req>, Responder<Res>, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.raw(name, MethodType::Duplex, move |call: ServerCall| {
            let handler = handler.clone();
            async move {
                let (requests, responder, context) = call.split_typed::<Req, Res>();
                handler(requests, responder, context).await
            }
        })
    }

    /// Freeze the bindings into a registry.
    pub fn build(self) -> ServiceRegistry {
        ServiceRegistry {
            methods: self.methods,
        }
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable name-to-handler map a server connection dispatches from.
pub struct ServiceRegistry {
    methods: HashMap<String, Arc<MethodEntry>>,
}

impl ServiceRegistry {
    /// Resolve a method full-name to its binding.
    pub(crate) fn resolve(&self, name: &str) -> Option<Arc<MethodEntry>> {
        self.methods.get(name).cloned()
    }

    /// Number of bound methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no methods are bound.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Run the bound handler for one accepted stream and write its trailer.
///
/// The handler runs in its own task so that a panic is isolated and
/// surfaced as an `Unknown` status rather than taking the multiplexer
/// down. Cancellation aborts the handler task.
pub(crate) async fn drive_handler(
    inner: Arc<ConnectionInner>,
    stream: Arc<RpcStream>,
    receivers: StreamReceivers,
    entry: Arc<MethodEntry>,
) {
    let call = ServerCall::new(stream.clone(), receivers);
    let mut join = tokio::spawn(entry.handler.call(call));

    let mut cancelled = stream.cancellation();
    let cancel_wait = async {
        if *cancelled.borrow() {
            return;
        }
        while cancelled.changed().await.is_ok() {
            if *cancelled.borrow() {
                return;
            }
        }
        // Signal source gone without firing; never resolves.
        std::future::pending::<()>().await
    };

    let mut joined = None;
    tokio::select! {
        result = &mut join => joined = Some(result),
        _ = cancel_wait => {}
    }

    let status = match joined {
        Some(Ok(Ok(()))) => Status::ok(),
        Some(Ok(Err(status))) if status.is_ok() => {
            Status::unknown("handler failed with OK status")
        }
        Some(Ok(Err(status))) => status,
        Some(Err(e)) if e.is_panic() => {
            let panic = e.into_panic();
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("panic in handler: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("panic in handler: {s}")
            } else {
                "panic in handler".to_string()
            };
            tracing::error!(stream_id = stream.id(), method = stream.method(), %message);
            Status::unknown(message)
        }
        Some(Err(_)) => Status::cancelled(),
        None => {
            // Cancellation fired first; stop the handler task.
            join.abort();
            let _ = join.await;
            Status::cancelled()
        }
    };

    // A cancelled or torn-down stream already resolved; no trailer then.
    if !stream.is_finished() {
        if let Err(e) = stream.send_trailer(&status).await {
            tracing::warn!(stream_id = stream.id(), error = %e, "failed to send trailer");
        }
    }
    inner.remove_stream(stream.id());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_registers_methods() {
        let registry = ServiceBuilder::new()
            .unary("/svc/echo", |text: String, _ctx| async move { Ok(text) })
            .client_streaming("/svc/sum", |mut input: Requests<i64>, _ctx| async move {
                let mut total = 0i64;
                while let Some(n) = input.next().await? {
                    total += n;
                }
                Ok(total)
            })
            .build();

        assert_eq!(registry.len(), 2);
        assert!(registry.resolve("/svc/echo").is_some());
        assert!(registry.resolve("/svc/sum").is_some());
        assert!(registry.resolve("/svc/missing").is_none());
    }

    #[tokio::test]
    async fn test_context_deadline_defaults_to_none() {
        use crate::pool::BufferPool;
        use crate::stream::Role;
        use crate::writer::{spawn_writer_task, WriterConfig};

        let (transport, _peer) = tokio::io::duplex(4096);
        let (writer, _task) = spawn_writer_task(transport, WriterConfig::default());
        let (stream, receivers) = RpcStream::new(
            1,
            "/svc/echo",
            MethodType::Unary,
            Role::Server,
            writer,
            BufferPool::new(),
        );

        let call = ServerCall::new(stream, receivers);
        assert!(call.deadline().is_none());
        assert!(call.context().deadline().is_none());
        assert!(!call.context().is_cancelled());
    }

    #[test]
    fn test_method_types_recorded() {
        let registry = ServiceBuilder::new()
            .unary("/s/u", |(): (), _ctx| async move { Ok(()) })
            .server_streaming("/s/ss", |(): (), _out: Responder<u32>, _ctx| async move {
                Ok(())
            })
            .duplex(
                "/s/dx",
                |_input: Requests<u32>, _out: Responder<u32>, _ctx| async move { Ok(()) },
            )
            .build();

        assert_eq!(
            registry.resolve("/s/u").unwrap().method_type,
            MethodType::Unary
        );
        assert_eq!(
            registry.resolve("/s/ss").unwrap().method_type,
            MethodType::ServerStreaming
        );
        assert_eq!(
            registry.resolve("/s/dx").unwrap().method_type,
            MethodType::Duplex
        );
    }
}
