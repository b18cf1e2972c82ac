//! Client call invoker.
//!
//! A [`Client`] is a cheap handle onto a connection that opens streams and
//! drives the four call shapes. The message surface is `Bytes`; typed
//! convenience wrappers go through [`MsgPackCodec`].
//!
//! # Example
//!
//! ```ignore
//! let client = connection.client_handle();
//! let reply = client.unary("/svc/echo", Bytes::from_static(b"hi")).await?;
//!
//! let mut listing = client.server_streaming("/svc/list", request).await?;
//! while let Some(item) = listing.next().await? {
//!     // ...
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;

use crate::codec::MsgPackCodec;
use crate::connection::ConnectionInner;
use crate::error::{Result, WiremuxError};
use crate::status::{Status, StatusCode};
use crate::stream::{MethodType, RpcStream, StreamReceivers};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Client-side deadline; an elapsed deadline cancels the stream and
    /// resolves the call with `DeadlineExceeded`.
    pub deadline: Option<Duration>,
}

impl CallOptions {
    /// Options with the given deadline.
    pub fn deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }
}

/// Call invoker for one connection.
///
/// Cheaply cloneable; all clones share the connection's stream table and
/// outbound queue.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ConnectionInner>,
}

impl Client {
    pub(crate) fn new(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    async fn start_call(
        &self,
        method: &str,
        method_type: MethodType,
        options: CallOptions,
    ) -> Result<(CallCore, StreamReceivers)> {
        let (stream, receivers) = self.inner.open_stream(method, method_type)?;
        let core = CallCore {
            stream: stream.clone(),
            conn: self.inner.clone(),
            deadline: options.deadline.map(|d| Instant::now() + d),
        };
        stream.send_new_stream().await?;
        Ok((core, receivers))
    }

    /// Issue a unary call and wait for the response.
    pub async fn unary(&self, method: &str, request: Bytes) -> Result<Bytes> {
        self.unary_with(method, request, CallOptions::default()).await
    }

    /// Issue a unary call with options.
    pub async fn unary_with(
        &self,
        method: &str,
        request: Bytes,
        options: CallOptions,
    ) -> Result<Bytes> {
        self.start_unary(method, request, options).await?.response().await
    }

    /// Start a unary call, keeping a handle that can cancel it.
    pub async fn start_unary(
        &self,
        method: &str,
        request: Bytes,
        options: CallOptions,
    ) -> Result<UnaryCall> {
        let (core, receivers) = self.start_call(method, MethodType::Unary, options).await?;
        core.stream.send_message(request, true).await?;
        Ok(UnaryCall { core, receivers })
    }

    /// Typed unary call through the MsgPack codec.
    pub async fn unary_msgpack<Req, Res>(&self, method: &str, request: &Req) -> Result<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let payload = Bytes::from(MsgPackCodec::encode(request)?);
        let response = self.unary(method, payload).await?;
        MsgPackCodec::decode(&response)
    }

    /// Start a client-streaming call.
    pub async fn client_streaming(&self, method: &str) -> Result<ClientStreamCall> {
        self.client_streaming_with(method, CallOptions::default()).await
    }

    /// Start a client-streaming call with options.
    pub async fn client_streaming_with(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<ClientStreamCall> {
        let (core, receivers) = self
            .start_call(method, MethodType::ClientStreaming, options)
            .await?;
        Ok(ClientStreamCall { core, receivers })
    }

    /// Start a server-streaming call with the single request message.
    pub async fn server_streaming(&self, method: &str, request: Bytes) -> Result<ServerStreamCall> {
        self.server_streaming_with(method, request, CallOptions::default())
            .await
    }

    /// Start a server-streaming call with options.
    pub async fn server_streaming_with(
        &self,
        method: &str,
        request: Bytes,
        options: CallOptions,
    ) -> Result<ServerStreamCall> {
        let (core, receivers) = self
            .start_call(method, MethodType::ServerStreaming, options)
            .await?;
        core.stream.send_message(request, true).await?;
        Ok(ServerStreamCall {
            core,
            receivers,
            final_status: None,
        })
    }

    /// Start a duplex call; both halves stream independently.
    pub async fn duplex(&self, method: &str) -> Result<DuplexCall> {
        self.duplex_with(method, CallOptions::default()).await
    }

    /// Start a duplex call with options.
    pub async fn duplex_with(&self, method: &str, options: CallOptions) -> Result<DuplexCall> {
        let (core, receivers) = self.start_call(method, MethodType::Duplex, options).await?;
        Ok(DuplexCall {
            core,
            receivers,
            final_status: None,
        })
    }
}

/// Shared state of one in-flight call.
///
/// Dropping it cleans up: an unfinished stream is cancelled on the wire and
/// resolved locally, and the table entry is removed either way.
struct CallCore {
    stream: Arc<RpcStream>,
    conn: Arc<ConnectionInner>,
    deadline: Option<Instant>,
}

impl Drop for CallCore {
    fn drop(&mut self) {
        if !self.stream.is_finished() {
            tracing::debug!(stream_id = self.stream.id(), "call dropped; cancelling stream");
            self.stream.send_cancel_best_effort();
            self.stream.abort(Status::cancelled());
        }
        self.conn.remove_stream(self.stream.id());
    }
}

/// Cancels a call from outside the task that is awaiting it.
#[derive(Clone)]
pub struct CancelHandle {
    stream: Arc<RpcStream>,
}

impl CancelHandle {
    /// Cancel the call: best-effort `Cancel` frame on the wire, local
    /// resolution with `Cancelled`. No-op on finished calls.
    pub fn cancel(&self) {
        if !self.stream.is_finished() {
            self.stream.send_cancel_best_effort();
            self.stream.abort(Status::cancelled());
        }
    }
}

/// A started unary call.
pub struct UnaryCall {
    core: CallCore,
    receivers: StreamReceivers,
}

impl UnaryCall {
    /// Handle for cancelling this call.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            stream: self.core.stream.clone(),
        }
    }

    /// Await the single response message and the OK trailer.
    pub async fn response(mut self) -> Result<Bytes> {
        let core = &self.core;
        let fut = finish_single_response(&mut self.receivers);
        with_deadline(core, fut).await
    }
}

/// A started client-streaming call.
pub struct ClientStreamCall {
    core: CallCore,
    receivers: StreamReceivers,
}

impl ClientStreamCall {
    /// Send one request message.
    pub async fn send(&self, message: Bytes) -> Result<()> {
        self.core.stream.send_message(message, false).await
    }

    /// Send the final request message (half-closes the local side).
    pub async fn send_last(&self, message: Bytes) -> Result<()> {
        self.core.stream.send_message(message, true).await
    }

    /// Typed send through the MsgPack codec.
    pub async fn send_msgpack<T: Serialize>(&self, message: &T) -> Result<()> {
        self.send(Bytes::from(MsgPackCodec::encode(message)?)).await
    }

    /// Handle for cancelling this call.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            stream: self.core.stream.clone(),
        }
    }

    /// Half-close if needed, then await the single response.
    pub async fn finish(mut self) -> Result<Bytes> {
        self.core.stream.send_half_close().await?;
        let core = &self.core;
        let fut = finish_single_response(&mut self.receivers);
        with_deadline(core, fut).await
    }
}

/// A started server-streaming call.
pub struct ServerStreamCall {
    core: CallCore,
    receivers: StreamReceivers,
    final_status: Option<Status>,
}

impl ServerStreamCall {
    /// Next response message, or `None` after a clean end of stream.
    ///
    /// A non-OK trailer surfaces as an error; later calls repeat it.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        next_message(&self.core, &mut self.receivers, &mut self.final_status).await
    }

    /// Typed receive through the MsgPack codec.
    pub async fn next_msgpack<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.next().await? {
            Some(bytes) => Ok(Some(MsgPackCodec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Handle for cancelling this call.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            stream: self.core.stream.clone(),
        }
    }
}

/// A started duplex call.
pub struct DuplexCall {
    core: CallCore,
    receivers: StreamReceivers,
    final_status: Option<Status>,
}

impl DuplexCall {
    /// Send one request message.
    pub async fn send(&self, message: Bytes) -> Result<()> {
        self.core.stream.send_message(message, false).await
    }

    /// Send the final request message (half-closes the local side).
    pub async fn send_last(&self, message: Bytes) -> Result<()> {
        self.core.stream.send_message(message, true).await
    }

    /// Half-close the sending side without a message.
    pub async fn finish_sending(&self) -> Result<()> {
        self.core.stream.send_half_close().await
    }

    /// Next response message, or `None` after a clean end of stream.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        next_message(&self.core, &mut self.receivers, &mut self.final_status).await
    }

    /// Handle for cancelling this call.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            stream: self.core.stream.clone(),
        }
    }
}

enum NextItem {
    Message(Bytes),
    Finished(Status),
}

/// Await the stream's next message or its terminal status.
async fn next_message(
    core: &CallCore,
    receivers: &mut StreamReceivers,
    final_status: &mut Option<Status>,
) -> Result<Option<Bytes>> {
    if let Some(status) = final_status {
        return if status.is_ok() {
            Ok(None)
        } else {
            Err(status.clone().into())
        };
    }

    let item = with_deadline(core, async {
        if let Some(message) = receivers.messages.recv().await {
            return Ok(NextItem::Message(message));
        }
        let status = (&mut receivers.trailer)
            .await
            .map_err(|_| WiremuxError::ConnectionClosed)?;
        Ok(NextItem::Finished(status))
    })
    .await?;

    match item {
        NextItem::Message(message) => Ok(Some(message)),
        NextItem::Finished(status) => {
            *final_status = Some(status.clone());
            if status.is_ok() {
                Ok(None)
            } else {
                Err(status.into())
            }
        }
    }
}

/// Await exactly one response message followed by an OK trailer.
async fn finish_single_response(receivers: &mut StreamReceivers) -> Result<Bytes> {
    let message = receivers.messages.recv().await;
    let status = (&mut receivers.trailer)
        .await
        .map_err(|_| WiremuxError::ConnectionClosed)?;

    if !status.is_ok() {
        return Err(status.into());
    }
    message.ok_or_else(|| {
        WiremuxError::Rpc(Status::new(
            StatusCode::Internal,
            "response message missing",
        ))
    })
}

/// Run `fut` under the call's deadline; on expiry cancel the stream and
/// resolve with `DeadlineExceeded`.
async fn with_deadline<T>(core: &CallCore, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match core.deadline {
        None => fut.await,
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => {
                core.stream.send_cancel_best_effort();
                core.stream.abort(Status::deadline_exceeded());
                Err(WiremuxError::Rpc(Status::deadline_exceeded()))
            }
        },
    }
}
