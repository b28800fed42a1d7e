use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::deadline::{self, Interrupted};
use crate::transport::{Inbound, Transport, TransportError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const METHOD_NOT_FOUND: i64 = -32601;

type PendingRequests = Arc<Mutex<HashMap<i64, PendingRequest>>>;

struct PendingRequest {
    method: String,
    created: Instant,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("request '{method}' timed out after {}s", .after.as_secs())]
    Timeout { method: String, after: Duration },
    #[error("connection closed")]
    Disconnected,
    #[error("server error {code}: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: i64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Serialize)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcMessage {
    // Required for JSON-RPC protocol deserialization; not read directly by Rust code.
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    result: Option<Value>,
    error: Option<JsonRpcErrorObject>,
    method: Option<String>,
    params: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
    data: Option<Value>,
}

/// A server → client notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    pending: PendingRequests,
    closed: AtomicBool,
    cancel: CancellationToken,
    label: String,
}

impl Inner {
    /// Tear everything down exactly once. Returns `false` if already done.
    fn shutdown(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();

        // Drain all pending requests so waiting callers get an error instead of hanging
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, p)| p).collect()
        };
        if !drained.is_empty() {
            let oldest = drained.iter().map(|p| p.created.elapsed()).max().unwrap_or_default();
            log::warn!(
                "Draining {} pending request(s) for '{}' ({}); oldest waited {:?}",
                drained.len(),
                self.label,
                reason,
                oldest
            );
        }
        for request in drained {
            log::debug!("Failing '{}' on '{}'", request.method, self.label);
            let _ = request.tx.send(Err(RpcError::Disconnected));
        }

        self.transport.close();
        true
    }
}

/// Removes a call's pending entry when the call finishes or is dropped, so a
/// late response is logged as unmatched.
struct PendingGuard<'a> {
    id: i64,
    pending: &'a PendingRequests,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(request) = self.pending.lock().remove(&self.id) {
            log::debug!("Abandoned '{}' (id {})", request.method, self.id);
        }
    }
}

/// JSON-RPC 2.0 client over any [`Transport`].
///
/// Requests are correlated by a per-client monotonically increasing id.
/// Each caller is resolved exactly once: by its response, by the timeout,
/// or by disconnect.
pub struct RpcClient {
    inner: Arc<Inner>,
    next_id: AtomicI64,
    timeout: Duration,
}

impl RpcClient {
    /// Take the transport's inbound stream and start the receive loop.
    /// Must be called from within a Tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        notifications: mpsc::UnboundedSender<RpcNotification>,
    ) -> Result<Self, RpcError> {
        Self::with_timeout(transport, notifications, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        transport: Arc<dyn Transport>,
        notifications: mpsc::UnboundedSender<RpcNotification>,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let inbound = transport.receive().ok_or(TransportError::NotConnected)?;
        let inner = Arc::new(Inner {
            label: transport.describe(),
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Self::reader_task(inbound, inner.clone(), notifications));

        Ok(Self {
            inner,
            next_id: AtomicI64::new(1),
            timeout,
        })
    }

    async fn reader_task(
        mut inbound: Inbound,
        inner: Arc<Inner>,
        notifications: mpsc::UnboundedSender<RpcNotification>,
    ) {
        loop {
            let body = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                body = inbound.recv() => match body {
                    Some(body) => body,
                    None => break,
                },
            };
            Self::handle_message(&body, &inner, &notifications);
        }
        inner.shutdown("stream ended");
    }

    fn handle_message(
        body: &[u8],
        inner: &Inner,
        notifications: &mpsc::UnboundedSender<RpcNotification>,
    ) {
        let msg: JsonRpcMessage = match serde_json::from_slice(body) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Failed to parse JSON-RPC message from '{}': {}", inner.label, e);
                return;
            }
        };

        match (msg.id, msg.method) {
            (Some(id), None) => {
                let Some(id_num) = id.as_i64() else {
                    log::warn!("Dropping response with non-numeric id {} from '{}'", id, inner.label);
                    return;
                };
                let Some(request) = inner.pending.lock().remove(&id_num) else {
                    log::debug!("Dropping unmatched response id {} from '{}'", id_num, inner.label);
                    return;
                };
                let outcome = match msg.error {
                    Some(error) => Err(RpcError::Server {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    }),
                    None => Ok(msg.result.unwrap_or(Value::Null)),
                };
                let _ = request.tx.send(outcome);
            }
            (Some(id), Some(method)) => Self::handle_server_request(&method, id, inner),
            (None, Some(method)) => {
                let _ = notifications.send(RpcNotification {
                    method,
                    params: msg.params,
                });
            }
            (None, None) => {
                log::warn!("Dropping JSON-RPC message with neither id nor method from '{}'", inner.label);
            }
        }
    }

    fn handle_server_request(method: &str, id: Value, inner: &Inner) {
        let reply = match method {
            "ping" => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {},
            }),
            _ => {
                log::debug!("Unhandled server request '{}' from '{}'", method, inner.label);
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": METHOD_NOT_FOUND,
                        "message": "Method not found",
                    }
                })
            }
        };
        if let Ok(body) = serde_json::to_vec(&reply) {
            if let Err(e) = inner.transport.send(body) {
                log::warn!("Failed to answer '{}' on '{}': {}", method, inner.label, e);
            }
        }
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_vec(&JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                created: Instant::now(),
                tx,
            },
        );
        // From here on the entry leaves the map however this future ends,
        // including when the caller drops it mid-wait.
        let _guard = PendingGuard {
            id,
            pending: &self.inner.pending,
        };
        // A shutdown that drained the map before our insert would never
        // resolve this entry, so check again now that it is visible.
        if self.is_closed() {
            return Err(RpcError::Disconnected);
        }

        self.inner.transport.send(body)?;

        match deadline::race(self.timeout, &self.inner.cancel, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(Interrupted::Cancelled) => Err(RpcError::Disconnected),
            Err(Interrupted::TimedOut(after)) => {
                log::warn!(
                    "Request '{}' (id {}) on '{}' timed out after {:?}",
                    method,
                    id,
                    self.inner.label,
                    after
                );
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    after,
                })
            }
        }
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Disconnected);
        }
        let body = serde_json::to_vec(&JsonRpcNotification {
            jsonrpc: "2.0",
            method,
            params,
        })?;
        self.inner.transport.send(body)?;
        Ok(())
    }

    /// Fail every in-flight call, stop the receive loop and close the
    /// transport. Calling it again does nothing.
    pub fn disconnect(&self) {
        if self.inner.shutdown("disconnect requested") {
            log::info!("Disconnected '{}'", self.inner.label);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Resolves once the client has shut down for any reason.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.inner.shutdown("client dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use std::sync::atomic::AtomicUsize;

    /// Wraps a channel transport and counts calls to `close`.
    struct CountingTransport {
        inner: ChannelTransport,
        closes: Arc<AtomicUsize>,
    }

    impl Transport for CountingTransport {
        fn send(&self, message: Vec<u8>) -> Result<(), TransportError> {
            self.inner.send(message)
        }
        fn receive(&self) -> Option<Inbound> {
            self.inner.receive()
        }
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close();
        }
        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    struct Harness {
        client: RpcClient,
        server: ChannelTransport,
        server_rx: Inbound,
        notifications: mpsc::UnboundedReceiver<RpcNotification>,
        closes: Arc<AtomicUsize>,
    }

    fn harness(timeout: Duration) -> Harness {
        let (client_end, server) = ChannelTransport::pair("rpc");
        let closes = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(CountingTransport {
            inner: client_end,
            closes: closes.clone(),
        });
        let (note_tx, notifications) = mpsc::unbounded_channel();
        let client = RpcClient::with_timeout(transport, note_tx, timeout).unwrap();
        let server_rx = server.receive().unwrap();
        Harness {
            client,
            server,
            server_rx,
            notifications,
            closes,
        }
    }

    async fn next_request(rx: &mut Inbound) -> Value {
        let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn reply(server: &ChannelTransport, value: Value) {
        server.send(serde_json::to_vec(&value).unwrap()).unwrap();
    }

    async fn wait_for_pending(client: &RpcClient, n: usize) {
        for _ in 0..200 {
            if client.pending_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pending count never reached {}", n);
    }

    #[tokio::test]
    async fn response_resolves_matching_call() {
        let mut h = harness(Duration::from_secs(5));
        let call = h.client.call("tools/list", Some(serde_json::json!({})));
        let server = async {
            let req = next_request(&mut h.server_rx).await;
            assert_eq!(req["jsonrpc"], "2.0");
            assert_eq!(req["method"], "tools/list");
            assert_eq!(req["id"], 1);
            reply(&h.server, serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}}));
        };
        let (result, ()) = tokio::join!(call, server);
        assert_eq!(result.unwrap(), serde_json::json!({"tools": []}));
        assert_eq!(h.client.pending_count(), 0);
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let mut h = harness(Duration::from_millis(30));
        let _ = h.client.call("a", None).await;
        let _ = h.client.call("b", None).await;
        assert_eq!(next_request(&mut h.server_rx).await["id"], 1);
        assert_eq!(next_request(&mut h.server_rx).await["id"], 2);
    }

    #[tokio::test]
    async fn server_error_object_fails_only_that_call() {
        let mut h = harness(Duration::from_secs(5));
        let call = h.client.call("tools/call", None);
        let server = async {
            let req = next_request(&mut h.server_rx).await;
            reply(
                &h.server,
                serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32602, "message": "bad params"}}),
            );
        };
        let (result, ()) = tokio::join!(call, server);
        match result {
            Err(RpcError::Server { code, message, .. }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad params");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!h.client.is_closed());
    }

    #[tokio::test]
    async fn timeout_resolves_once_and_late_response_is_dropped() {
        let mut h = harness(Duration::from_millis(40));
        let result = h.client.call("slow", None).await;
        assert!(matches!(result, Err(RpcError::Timeout { ref method, .. }) if method == "slow"));
        assert_eq!(h.client.pending_count(), 0);

        // The late answer must not resolve anything or kill the loop.
        let req = next_request(&mut h.server_rx).await;
        reply(&h.server, serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "result": 1}));

        let call = h.client.call("fast", None);
        let server = async {
            let req = next_request(&mut h.server_rx).await;
            reply(&h.server, serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "result": "ok"}));
        };
        let (result, ()) = tokio::join!(call, server);
        assert_eq!(result.unwrap(), serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn dropped_call_leaves_no_pending_entry() {
        let mut h = harness(Duration::from_secs(30));
        let outer = tokio::time::timeout(Duration::from_millis(20), h.client.call("slow", None)).await;
        assert!(outer.is_err());
        assert_eq!(h.client.pending_count(), 0);

        // The answer to the abandoned call is unmatched and harmless.
        let req = next_request(&mut h.server_rx).await;
        reply(&h.server, serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "result": 1}));
        let call = h.client.call("next", None);
        let server = async {
            let req = next_request(&mut h.server_rx).await;
            reply(&h.server, serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "result": 2}));
        };
        let (result, ()) = tokio::join!(call, server);
        assert_eq!(result.unwrap(), serde_json::json!(2));
        assert_eq!(h.client.pending_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_fails_every_pending_call() {
        let h = harness(Duration::from_secs(30));
        let client = Arc::new(h.client);
        let first = tokio::spawn({
            let client = client.clone();
            async move { client.call("one", None).await }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.call("two", None).await }
        });
        wait_for_pending(&client, 2).await;

        client.disconnect();
        assert!(matches!(first.await.unwrap(), Err(RpcError::Disconnected)));
        assert!(matches!(second.await.unwrap(), Err(RpcError::Disconnected)));
        assert_eq!(client.pending_count(), 0);
        assert!(matches!(client.call("after", None).await, Err(RpcError::Disconnected)));
    }

    #[tokio::test]
    async fn disconnect_twice_cleans_up_once() {
        let h = harness(Duration::from_secs(5));
        h.client.disconnect();
        h.client.disconnect();
        assert!(h.client.is_closed());
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
        drop(h.client);
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_hangup_fails_pending_calls() {
        let h = harness(Duration::from_secs(30));
        let Harness { client, server, server_rx, .. } = h;
        let client = Arc::new(client);
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("hang", None).await }
        });
        wait_for_pending(&client, 1).await;
        server.close();
        drop(server_rx);
        assert!(matches!(call.await.unwrap(), Err(RpcError::Disconnected)));
        tokio::time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn malformed_and_unmatched_messages_are_ignored() {
        let mut h = harness(Duration::from_secs(5));
        h.server.send(b"not json at all".to_vec()).unwrap();
        reply(&h.server, serde_json::json!({"jsonrpc": "2.0", "id": 999, "result": null}));
        reply(&h.server, serde_json::json!({"jsonrpc": "2.0"}));

        let call = h.client.call("still-alive", None);
        let server = async {
            let req = next_request(&mut h.server_rx).await;
            reply(&h.server, serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "result": true}));
        };
        let (result, ()) = tokio::join!(call, server);
        assert_eq!(result.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn notifications_are_forwarded_and_notify_has_no_id() {
        let mut h = harness(Duration::from_secs(5));
        reply(
            &h.server,
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
        );
        let note = tokio::time::timeout(Duration::from_secs(5), h.notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.method, "notifications/tools/list_changed");

        h.client.notify("notifications/initialized", None).unwrap();
        let sent = next_request(&mut h.server_rx).await;
        assert_eq!(sent["method"], "notifications/initialized");
        assert!(sent.get("id").is_none());
        assert!(sent.get("params").is_none());
    }

    #[tokio::test]
    async fn server_ping_gets_an_answer() {
        let mut h = harness(Duration::from_secs(5));
        reply(&h.server, serde_json::json!({"jsonrpc": "2.0", "id": "p1", "method": "ping"}));
        let answer = next_request(&mut h.server_rx).await;
        assert_eq!(answer["id"], "p1");
        assert_eq!(answer["result"], serde_json::json!({}));

        reply(&h.server, serde_json::json!({"jsonrpc": "2.0", "id": 7, "method": "sampling/createMessage"}));
        let answer = next_request(&mut h.server_rx).await;
        assert_eq!(answer["error"]["code"], METHOD_NOT_FOUND);
    }
}
