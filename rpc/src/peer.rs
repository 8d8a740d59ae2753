//! Bidirectional JSON-RPC peer.
//!
//! One peer owns one connection. A reader task classifies incoming frames
//! and dispatches them; a writer task serialises outgoing frames from an
//! mpsc channel. Outgoing requests are correlated to responses through a
//! pending map of oneshot senders. Incoming requests are served by
//! registered *features*; each in-flight incoming request carries a
//! [`CancelToken`] fired by `$/cancelRequest`.
//!
//! When the connection ends (EOF, reset, or local stop) every pending
//! request completes with `NoResponse("server was stopped")` and the exit
//! callback runs once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::cancel::CancelToken;
use crate::codec::{FrameReader, FrameWriter};
use crate::error::{ErrorObject, RpcError};
use crate::message::{IncomingMessage, Notification, Request, RequestId, Response, parse_message};
use crate::methods;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Default timeout for [`PeerHandle::request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a feature handler.
pub type FeatureReply = Result<serde_json::Value, ErrorObject>;

type BoxedFeature = Arc<
    dyn Fn(serde_json::Value, CancelToken) -> Pin<Box<dyn Future<Output = FeatureReply> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a request feature.
pub fn feature_fn<F, Fut>(f: F) -> BoxedFeature
where
    F: Fn(serde_json::Value, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FeatureReply> + Send + 'static,
{
    Arc::new(move |params, token| Box::pin(f(params, token)))
}

/// Wrap an async closure as a notification feature (no reply).
pub fn notification_fn<F, Fut>(f: F) -> BoxedFeature
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |params, _token| {
        let fut = f(params);
        Box::pin(async move {
            fut.await;
            Ok(serde_json::Value::Null)
        })
    })
}

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

type PendingMap = Mutex<HashMap<RequestId, oneshot::Sender<Result<serde_json::Value, RpcError>>>>;
type InFlightMap = Mutex<HashMap<RequestId, CancelToken>>;
type ExitCallback = Box<dyn Fn() + Send + Sync>;

struct PeerShared {
    name: String,
    writer_tx: mpsc::Sender<WriterCommand>,
    pending: PendingMap,
    in_flight: InFlightMap,
    features: HashMap<String, BoxedFeature>,
    next_id: AtomicU64,
    stopped: AtomicBool,
    exit_fired: AtomicBool,
    on_exit: Option<ExitCallback>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PeerShared {
    /// Mark the peer stopped: fail pending requests, cancel in-flight
    /// incoming work, fire the exit callback once.
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = {
            let mut map = self.pending.lock().expect("pending map poisoned");
            std::mem::take(&mut *map)
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::NoResponse("server was stopped".to_string())));
        }
        let in_flight = {
            let mut map = self.in_flight.lock().expect("in-flight map poisoned");
            std::mem::take(&mut *map)
        };
        for (_, token) in in_flight {
            token.cancel();
        }
        if !self.exit_fired.swap(true, Ordering::SeqCst)
            && let Some(on_exit) = &self.on_exit
        {
            on_exit();
        }
    }
}

/// Builder registering features and the exit callback before the
/// connection starts.
pub struct PeerBuilder {
    name: String,
    features: HashMap<String, BoxedFeature>,
    on_exit: Option<ExitCallback>,
}

impl PeerBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: HashMap::new(),
            on_exit: None,
        }
    }

    /// Register a handler for an incoming method (request or notification).
    #[must_use]
    pub fn feature(mut self, method: &str, handler: BoxedFeature) -> Self {
        self.features.insert(method.to_string(), handler);
        self
    }

    /// Callback invoked once when the connection goes away.
    #[must_use]
    pub fn on_exit(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_exit = Some(Box::new(callback));
        self
    }

    /// Spawn the reader and writer tasks over the given stream halves.
    pub fn start<R, W>(self, reader: R, writer: W) -> PeerHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);

        let shared = Arc::new(PeerShared {
            name: self.name,
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            features: self.features,
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            exit_fired: AtomicBool::new(false),
            on_exit: self.on_exit,
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(async move {
            let mut frame_writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = frame_writer.write_frame(&frame).await {
                            tracing::warn!("rpc write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            let mut frame_reader = FrameReader::new(reader);
            loop {
                match frame_reader.read_frame().await {
                    Ok(Some(frame)) => dispatch_frame(&reader_shared, frame),
                    Ok(None) => {
                        tracing::info!(peer = %reader_shared.name, "connection closed");
                        break;
                    }
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!(peer = %reader_shared.name, "dropped frame: {e}");
                    }
                    Err(e) => {
                        tracing::warn!(peer = %reader_shared.name, "connection lost: {e}");
                        break;
                    }
                }
            }
            reader_shared.stop();
            let _ = reader_shared.writer_tx.try_send(WriterCommand::Shutdown);
        });

        shared
            .tasks
            .lock()
            .expect("task list poisoned")
            .extend([writer_task, reader_task]);

        PeerHandle { shared }
    }
}

fn dispatch_frame(shared: &Arc<PeerShared>, frame: serde_json::Value) {
    let Some(message) = parse_message(frame) else {
        tracing::trace!(peer = %shared.name, "ignoring shapeless JSON-RPC frame");
        return;
    };
    match message {
        IncomingMessage::Response(response) => handle_response(shared, response),
        IncomingMessage::Request(request) => handle_request(shared, request),
        IncomingMessage::Notification(notification) => handle_notification(shared, notification),
    }
}

fn handle_response(shared: &Arc<PeerShared>, response: Response) {
    let sender = {
        let mut pending = shared.pending.lock().expect("pending map poisoned");
        pending.remove(&response.id)
    };
    let Some(tx) = sender else {
        // Late response for a timed-out or cancelled request.
        tracing::trace!(peer = %shared.name, id = %response.id, "discarding late response");
        return;
    };
    let outcome = match (response.result, response.error) {
        (_, Some(error)) => Err(RpcError::from_error_object(response.id, error)),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(serde_json::Value::Null),
    };
    let _ = tx.send(outcome);
}

fn handle_request(shared: &Arc<PeerShared>, request: Request) {
    let Some(handler) = shared.features.get(&request.method).cloned() else {
        tracing::debug!(
            peer = %shared.name,
            method = %request.method,
            "replying method not found"
        );
        let response = Response::error(request.id, ErrorObject::method_not_found(&request.method));
        send_frame(shared, serde_json::to_value(&response));
        return;
    };

    let token = CancelToken::new();
    shared
        .in_flight
        .lock()
        .expect("in-flight map poisoned")
        .insert(request.id.clone(), token.clone());

    let task_shared = shared.clone();
    tokio::spawn(async move {
        let params = request.params.unwrap_or(serde_json::Value::Null);
        let reply = handler(params, token).await;
        task_shared
            .in_flight
            .lock()
            .expect("in-flight map poisoned")
            .remove(&request.id);
        let response = match reply {
            Ok(result) => Response::result(request.id, result),
            Err(error) => Response::error(request.id, error),
        };
        send_frame_async(&task_shared, serde_json::to_value(&response)).await;
    });
}

fn handle_notification(shared: &Arc<PeerShared>, notification: Notification) {
    if notification.method == methods::CANCEL_REQUEST {
        let id = notification
            .params
            .as_ref()
            .and_then(|p| p.get("id"))
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
        let Some(id) = id else {
            tracing::debug!(peer = %shared.name, "cancel request without id");
            return;
        };
        let token = {
            let in_flight = shared.in_flight.lock().expect("in-flight map poisoned");
            in_flight.get(&id).cloned()
        };
        if let Some(token) = token {
            tracing::debug!(peer = %shared.name, id = %id, "cancelling in-flight request");
            token.cancel();
        }
        return;
    }

    let Some(handler) = shared.features.get(&notification.method).cloned() else {
        tracing::trace!(
            peer = %shared.name,
            method = %notification.method,
            "dropping unhandled notification"
        );
        return;
    };
    let params = notification.params.unwrap_or(serde_json::Value::Null);
    tokio::spawn(async move {
        let _ = handler(params, CancelToken::new()).await;
    });
}

fn send_frame(shared: &Arc<PeerShared>, frame: serde_json::Result<serde_json::Value>) {
    match frame {
        Ok(frame) => {
            if shared
                .writer_tx
                .try_send(WriterCommand::Send(frame))
                .is_err()
            {
                tracing::warn!(peer = %shared.name, "writer channel full or closed");
            }
        }
        Err(e) => tracing::warn!(peer = %shared.name, "failed to serialise frame: {e}"),
    }
}

async fn send_frame_async(shared: &Arc<PeerShared>, frame: serde_json::Result<serde_json::Value>) {
    match frame {
        Ok(frame) => {
            if shared
                .writer_tx
                .send(WriterCommand::Send(frame))
                .await
                .is_err()
            {
                tracing::warn!(peer = %shared.name, "writer channel closed");
            }
        }
        Err(e) => tracing::warn!(peer = %shared.name, "failed to serialise frame: {e}"),
    }
}

/// Cloneable handle for originating requests and notifications.
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    /// Send a request and await its response with the default timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RpcError> {
        self.request_with_timeout(method, params, Some(DEFAULT_REQUEST_TIMEOUT))
            .await
    }

    /// Send a request with an explicit timeout; `None` waits indefinitely
    /// (streaming calls).
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RpcError> {
        let id = self.next_request_id();
        self.request_with_id(id, method, params, timeout).await
    }

    /// Send a request under a caller-chosen id (needed by callers that will
    /// cancel it).
    pub async fn request_with_id(
        &self,
        id: RequestId,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RpcError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(RpcError::Stopped);
        }

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending map poisoned")
            .insert(id.clone(), tx);

        let request = Request::new(id.clone(), method, params);
        let frame = serde_json::to_value(&request)
            .map_err(|e| RpcError::InvalidResponse(format!("unserialisable request: {e}")))?;
        if self
            .shared
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            // Don't leak the pending entry if the writer is gone.
            self.shared
                .pending
                .lock()
                .expect("pending map poisoned")
                .remove(&id);
            return Err(RpcError::NoResponse("writer channel closed".to_string()));
        }

        let received = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Remove the entry so repeated timeouts don't grow the map.
                    self.shared
                        .pending
                        .lock()
                        .expect("pending map poisoned")
                        .remove(&id);
                    return Err(RpcError::ResponseTimeout);
                }
            },
            None => rx.await,
        };

        match received {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::NoResponse("server was stopped".to_string())),
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), RpcError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(RpcError::Stopped);
        }
        let notification = Notification::new(method, params);
        let frame = serde_json::to_value(&notification)
            .map_err(|e| RpcError::InvalidResponse(format!("unserialisable notification: {e}")))?;
        self.shared
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| RpcError::NoResponse("writer channel closed".to_string()))
    }

    /// Cancel an in-flight outgoing request. The final response (typically
    /// status `stopped`) still completes the original future; if the peer
    /// replies with the cancellation error code the future fails with
    /// [`RpcError::RequestCancelled`].
    pub async fn cancel(&self, id: &RequestId) -> Result<(), RpcError> {
        self.notify(
            methods::CANCEL_REQUEST,
            Some(serde_json::json!({ "id": id })),
        )
        .await
    }

    /// Allocate the next numeric request id.
    #[must_use]
    pub fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Whether the connection has gone away.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Stop the peer locally: fail pending requests, then tear down the
    /// reader and writer tasks so the transport halves drop and the remote
    /// side observes EOF.
    pub fn stop(&self) {
        self.shared.stop();
        let _ = self.shared.writer_tx.try_send(WriterCommand::Shutdown);
        let tasks = {
            let mut tasks = self.shared.tasks.lock().expect("task list poisoned");
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two connected peers over an in-memory duplex stream.
    fn peer_pair(server: PeerBuilder) -> (PeerHandle, PeerHandle) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client = PeerBuilder::new("client").start(client_read, client_write);
        let server = server.start(server_read, server_write);
        (client, server)
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let server = PeerBuilder::new("server").feature(
            "math/add",
            feature_fn(|params, _token| async move {
                let a = params["a"].as_i64().unwrap_or(0);
                let b = params["b"].as_i64().unwrap_or(0);
                Ok(serde_json::json!(a + b))
            }),
        );
        let (client, _server) = peer_pair(server);

        let result = client
            .request("math/add", Some(serde_json::json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(5));
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let (client, _server) = peer_pair(PeerBuilder::new("server"));

        let err = client.request("no/such", None).await.unwrap_err();
        match err {
            RpcError::ErrorOnRequest { code, message, .. } => {
                assert_eq!(code, crate::error::error_codes::METHOD_NOT_FOUND);
                assert!(message.contains("no/such"));
            }
            other => panic!("expected ErrorOnRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notifications_reach_registered_feature() {
        let (tx, mut rx) = mpsc::channel::<serde_json::Value>(4);
        let server = PeerBuilder::new("server").feature(
            "log/event",
            notification_fn(move |params| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(params).await;
                }
            }),
        );
        let (client, _server) = peer_pair(server);

        client
            .notify("log/event", Some(serde_json::json!({"msg": "hello"})))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received["msg"], "hello");
    }

    #[tokio::test]
    async fn unregistered_notification_is_dropped() {
        let (client, _server) = peer_pair(PeerBuilder::new("server"));
        // Must not error or panic; there is simply no observable effect.
        client.notify("no/feature", None).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_request_fires_handler_token() {
        let server = PeerBuilder::new("server").feature(
            "work/slow",
            feature_fn(|_params, token| async move {
                token.cancelled().await;
                // Cancelled handlers reply with their partial aggregate.
                Ok(serde_json::json!({"status": "stopped"}))
            }),
        );
        let (client, _server) = peer_pair(server);

        let id = client.next_request_id();
        let request_client = client.clone();
        let request_id = id.clone();
        let request = tokio::spawn(async move {
            request_client
                .request_with_id(request_id, "work/slow", None, None)
                .await
        });

        // Let the request land before cancelling.
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.cancel(&id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result["status"], "stopped");
    }

    #[tokio::test]
    async fn peer_loss_fails_pending_with_no_response() {
        let server = PeerBuilder::new("server").feature(
            "work/hang",
            feature_fn(|_params, token| async move {
                token.cancelled().await;
                Ok(serde_json::Value::Null)
            }),
        );
        let (client, server) = peer_pair(server);

        let request_client = client.clone();
        let request =
            tokio::spawn(
                async move { request_client.request_with_id(
                    RequestId::Number(900),
                    "work/hang",
                    None,
                    None,
                ).await },
            );

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop();

        let err = tokio::time::timeout(Duration::from_secs(2), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RpcError::NoResponse(_)), "got {err:?}");
        assert!(client.is_stopped() || server.is_stopped());
    }

    #[tokio::test]
    async fn request_after_stop_fails_fast() {
        let (client, _server) = peer_pair(PeerBuilder::new("server"));
        client.stop();
        let err = client.request("anything", None).await.unwrap_err();
        assert!(matches!(err, RpcError::Stopped));
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let server = PeerBuilder::new("server").feature(
            "work/forever",
            feature_fn(|_params, token| async move {
                token.cancelled().await;
                Ok(serde_json::Value::Null)
            }),
        );
        let (client, _server) = peer_pair(server);

        let err = client
            .request_with_timeout("work/forever", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ResponseTimeout));
        assert!(client.shared.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exit_callback_fires_once_on_stop() {
        let count = Arc::new(AtomicU64::new(0));
        let cb_count = count.clone();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client = PeerBuilder::new("client")
            .on_exit(move || {
                cb_count.fetch_add(1, Ordering::SeqCst);
            })
            .start(client_read, client_write);
        let server = PeerBuilder::new("server").start(server_read, server_write);

        server.stop();
        // Give the client's reader task time to observe EOF.
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.stop();
        client.stop();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn both_sides_may_originate_requests() {
        let server = PeerBuilder::new("server").feature(
            "ping",
            feature_fn(|_p, _t| async move { Ok(serde_json::json!("pong")) }),
        );
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client = PeerBuilder::new("client")
            .feature(
                "ping",
                feature_fn(|_p, _t| async move { Ok(serde_json::json!("pong-from-client")) }),
            )
            .start(client_read, client_write);
        let server = server.start(server_read, server_write);

        assert_eq!(
            client.request("ping", None).await.unwrap(),
            serde_json::json!("pong")
        );
        assert_eq!(
            server.request("ping", None).await.unwrap(),
            serde_json::json!("pong-from-client")
        );
    }
}
