//! Byte-stream transports that carry MCP JSON-RPC messages.
//!
//! A transport moves whole messages: `send` takes one serialized message,
//! `receive` hands out the inbound stream for the lifetime of the
//! connection, `close` tears the connection down and may be called any
//! number of times.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Inbound message stream of one connection.
pub type Inbound = mpsc::UnboundedReceiver<Vec<u8>>;

/// Reject absurdly large messages to prevent memory exhaustion (32 MB limit).
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

const SSE_ENDPOINT_WAIT: Duration = Duration::from_secs(10);
const SSE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process '{0}' is not running")]
    ProcessNotRunning(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("transport closed")]
    Closed,
}

pub trait Transport: Send + Sync {
    /// Queue one message for delivery. Framing is the transport's job.
    fn send(&self, message: Vec<u8>) -> Result<(), TransportError>;

    /// Take the inbound stream. Returns `None` once it has been taken.
    fn receive(&self) -> Option<Inbound>;

    /// Release the process or connection. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Short human-readable label for logs.
    fn describe(&self) -> String;
}

/// Channel plumbing shared by every transport kind.
struct Pipes {
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: Mutex<Option<Inbound>>,
    closed: AtomicBool,
}

impl Pipes {
    fn new(outbound: mpsc::UnboundedSender<Vec<u8>>, inbound: Inbound) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            closed: AtomicBool::new(false),
        }
    }

    fn send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let guard = self.outbound.lock();
        let sender = guard.as_ref().ok_or(TransportError::NotConnected)?;
        sender
            .send(message)
            .map_err(|_| TransportError::Send("writer has stopped".to_string()))
    }

    fn take_inbound(&self) -> Option<Inbound> {
        self.inbound.lock().take()
    }

    /// Returns `true` only for the call that actually closed the pipes.
    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Dropping the sender stops the writer, which releases stdin / the POST loop.
        self.outbound.lock().take();
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Newline framing
// ---------------------------------------------------------------------------

/// Splits a byte stream into newline-delimited messages.
///
/// Partial trailing fragments are kept until the next chunk completes them.
/// A trailing `\r` is stripped and blank lines are skipped.
pub struct LineFramer {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(8192),
            max_len,
            discarding: false,
        }
    }

    /// Feed a chunk and collect every message it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            if self.discarding {
                // End of an oversized line; resync on the next one.
                self.discarding = false;
                self.buf.clear();
            } else {
                self.buf.extend_from_slice(&rest[..pos]);
                if let Some(line) = self.take_line() {
                    out.push(line);
                }
            }
            rest = &rest[pos + 1..];
        }

        if !rest.is_empty() && !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > self.max_len {
                log::warn!(
                    "Message exceeds {} bytes without a newline, discarding",
                    self.max_len
                );
                self.buf.clear();
                self.discarding = true;
            }
        }

        out
    }

    /// Flush a final unterminated fragment at end of stream.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.discarding {
            self.discarding = false;
            self.buf.clear();
            return None;
        }
        self.take_line()
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let mut line = std::mem::take(&mut self.buf);
        if line.len() > self.max_len {
            log::warn!("Message too large ({} bytes), skipping", line.len());
            return None;
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        Some(line)
    }
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser, fed one line at a time.
#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (with or without its line terminator). Returns an
    /// event when the line completes one.
    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    /// Dispatch whatever is buffered at end of stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseEvent {
            event: self.event.take(),
            data,
            id: self.last_id.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Stdio
// ---------------------------------------------------------------------------

/// Child process speaking newline-delimited JSON on stdin/stdout.
pub struct StdioTransport {
    pipes: Pipes,
    exited: Arc<AtomicBool>,
    kill: CancellationToken,
    command: String,
}

impl StdioTransport {
    /// Spawn `command`. Must be called from within a Tokio runtime.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        log::info!("MCP stdio: starting '{}' with args {:?}", command, args);

        let mut child = TokioCommand::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(TransportError::NotConnected)?;
        let stdout = child.stdout.take().ok_or(TransportError::NotConnected)?;
        let stderr = child.stderr.take();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(Self::writer_task(stdin, outbound_rx));
        tokio::spawn(Self::reader_task(stdout, inbound_tx, command.to_string()));

        if let Some(stderr) = stderr {
            let cmd_name = command.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                log::warn!("MCP stderr [{}]: {}", cmd_name, trimmed);
                            }
                        }
                    }
                }
            });
        }

        let exited = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();
        {
            let exited = exited.clone();
            let kill = kill.clone();
            let cmd_name = command.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        log::warn!("MCP server '{}' exited with status: {:?}", cmd_name, status);
                    }
                    _ = kill.cancelled() => {
                        if let Err(e) = child.kill().await {
                            log::debug!("Failed to kill MCP server '{}': {}", cmd_name, e);
                        }
                    }
                }
                exited.store(true, Ordering::SeqCst);
            });
        }

        Ok(Self {
            pipes: Pipes::new(outbound_tx, inbound_rx),
            exited,
            kill,
            command: command.to_string(),
        })
    }

    async fn writer_task(
        mut stdin: tokio::process::ChildStdin,
        mut receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(mut msg) = receiver.recv().await {
            msg.push(b'\n');
            if stdin.write_all(&msg).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    }

    async fn reader_task(
        mut stdout: tokio::process::ChildStdout,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
        command: String,
    ) {
        let mut framer = LineFramer::default();
        let mut buf = vec![0u8; 8192];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for message in framer.push(&buf[..n]) {
                        if inbound.send(message).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("MCP stdout read error for '{}': {}", command, e);
                    break;
                }
            }
        }
        if let Some(message) = framer.finish() {
            let _ = inbound.send(message);
        }
    }
}

impl Transport for StdioTransport {
    fn send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessNotRunning(self.command.clone()));
        }
        self.pipes.send(message)
    }

    fn receive(&self) -> Option<Inbound> {
        self.pipes.take_inbound()
    }

    fn close(&self) {
        if self.pipes.shut() {
            log::info!("MCP stdio: closing '{}'", self.command);
            self.kill.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.pipes.is_closed()
    }

    fn describe(&self) -> String {
        format!("stdio:{}", self.command)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

/// Sender half of the inbound stream, shared by the GET and POST threads.
/// Taking it ends the stream for the reader even while the GET thread is
/// blocked on the socket.
#[derive(Clone)]
struct InboundSlot(Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>);

impl InboundSlot {
    fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    /// Returns `false` once the stream has been shut.
    fn forward(&self, message: Vec<u8>) -> bool {
        match self.0.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    fn shut(&self) {
        self.0.lock().take();
    }
}

/// Long-lived `text/event-stream` GET for inbound messages, plain POSTs for
/// outbound ones.
///
/// A blocking read cannot be interrupted, so after `close` the GET thread
/// releases its connection when the next line (usually a keep-alive
/// comment) arrives. The inbound stream ends immediately either way.
pub struct SseTransport {
    pipes: Pipes,
    inbound: InboundSlot,
    stop: Arc<AtomicBool>,
    stream_url: String,
}

impl SseTransport {
    /// Open the event stream. When `message_url` is `None`, waits for the
    /// server's `endpoint` event to learn where to POST.
    pub async fn connect(
        url: &str,
        message_url: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let stream_url =
            url::Url::parse(url).map_err(|_| TransportError::InvalidEndpoint(url.to_string()))?;
        if !matches!(stream_url.scheme(), "http" | "https") {
            return Err(TransportError::InvalidEndpoint(url.to_string()));
        }
        let configured_endpoint = match message_url {
            Some(raw) => Some(
                stream_url
                    .join(raw)
                    .map_err(|_| TransportError::InvalidEndpoint(raw.to_string()))?,
            ),
            None => None,
        };

        log::info!("MCP sse: connecting to {}", stream_url);

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_connect(Some(SSE_CONNECT_TIMEOUT))
            .build()
            .into();

        let response = {
            let agent = agent.clone();
            let stream_url = stream_url.to_string();
            let headers = headers.clone();
            tokio::task::spawn_blocking(move || {
                let mut request = agent.get(&stream_url).header("Accept", "text/event-stream");
                for (key, value) in &headers {
                    request = request.header(key.as_str(), value.as_str());
                }
                request.call()
            })
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .map_err(|e| TransportError::Http(e.to_string()))?
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let inbound = InboundSlot::new(inbound_tx);
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<url::Url>();
        let stop = Arc::new(AtomicBool::new(false));

        {
            let stop = stop.clone();
            let inbound = inbound.clone();
            let base = stream_url.clone();
            std::thread::spawn(move || {
                let reader = std::io::BufReader::new(response.into_body().into_reader());
                Self::stream_loop(reader, base, inbound, endpoint_tx, stop);
            });
        }

        let endpoint = match configured_endpoint {
            Some(endpoint) => endpoint,
            None => match tokio::time::timeout(SSE_ENDPOINT_WAIT, endpoint_rx).await {
                Ok(Ok(endpoint)) => endpoint,
                _ => {
                    stop.store(true, Ordering::SeqCst);
                    inbound.shut();
                    return Err(TransportError::InvalidEndpoint(format!(
                        "{} did not announce a message endpoint",
                        stream_url
                    )));
                }
            },
        };
        log::info!("MCP sse: posting messages to {}", endpoint);

        {
            let headers = headers.clone();
            let inbound = inbound.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                Self::post_loop(agent, endpoint, headers, outbound_rx, inbound, stop)
            });
        }

        Ok(Self {
            pipes: Pipes::new(outbound_tx, inbound_rx),
            inbound,
            stop,
            stream_url: stream_url.to_string(),
        })
    }

    fn stream_loop(
        mut reader: impl BufRead,
        base: url::Url,
        inbound: InboundSlot,
        endpoint_tx: oneshot::Sender<url::Url>,
        stop: Arc<AtomicBool>,
    ) {
        let mut decoder = SseDecoder::new();
        let mut endpoint_tx = Some(endpoint_tx);
        let mut line = String::new();
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("MCP sse stream error from {}: {}", base, e);
                    break;
                }
            }
            let Some(event) = decoder.push_line(&line) else {
                continue;
            };
            match event.event.as_deref() {
                Some("endpoint") => match base.join(event.data.trim()) {
                    Ok(endpoint) => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(endpoint);
                        }
                    }
                    Err(e) => log::warn!("Invalid SSE endpoint '{}': {}", event.data, e),
                },
                None | Some("message") => {
                    if event.data.len() > MAX_MESSAGE_SIZE {
                        log::warn!("SSE message too large ({} bytes), skipping", event.data.len());
                        continue;
                    }
                    if !inbound.forward(event.data.into_bytes()) {
                        break;
                    }
                }
                Some(other) => log::debug!("Ignoring SSE event '{}'", other),
            }
        }
        inbound.shut();
        log::info!("MCP sse: stream from {} ended", base);
    }

    fn post_loop(
        agent: ureq::Agent,
        endpoint: url::Url,
        headers: HashMap<String, String>,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        inbound: InboundSlot,
        stop: Arc<AtomicBool>,
    ) {
        while let Some(message) = outbound.blocking_recv() {
            let mut request = agent
                .post(endpoint.as_str())
                .header("Content-Type", "application/json");
            for (key, value) in &headers {
                request = request.header(key.as_str(), value.as_str());
            }
            if let Err(e) = request.send(&message[..]) {
                // The message is lost; end the connection so its caller fails now.
                log::warn!("MCP sse POST to {} failed, closing: {}", endpoint, e);
                stop.store(true, Ordering::SeqCst);
                inbound.shut();
                return;
            }
        }
    }
}

impl Transport for SseTransport {
    fn send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        self.pipes.send(message)
    }

    fn receive(&self) -> Option<Inbound> {
        self.pipes.take_inbound()
    }

    fn close(&self) {
        if self.pipes.shut() {
            log::info!("MCP sse: closing {}", self.stream_url);
            self.stop.store(true, Ordering::SeqCst);
            self.inbound.shut();
        }
    }

    fn is_closed(&self) -> bool {
        self.pipes.is_closed()
    }

    fn describe(&self) -> String {
        format!("sse:{}", self.stream_url)
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// In-process channel pair
// ---------------------------------------------------------------------------

/// One end of an in-process connection. Messages sent on one end arrive on
/// the other end's inbound stream.
pub struct ChannelTransport {
    pipes: Pipes,
    label: String,
}

impl ChannelTransport {
    pub fn pair(label: &str) -> (ChannelTransport, ChannelTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                pipes: Pipes::new(a_tx, b_rx),
                label: format!("{}:client", label),
            },
            ChannelTransport {
                pipes: Pipes::new(b_tx, a_rx),
                label: format!("{}:server", label),
            },
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        self.pipes.send(message)
    }

    fn receive(&self) -> Option<Inbound> {
        self.pipes.take_inbound()
    }

    fn close(&self) {
        if self.pipes.shut() {
            // An untaken inbound stream is dropped so the peer's sends fail.
            self.pipes.take_inbound();
        }
    }

    fn is_closed(&self) -> bool {
        self.pipes.is_closed()
    }

    fn describe(&self) -> String {
        format!("channel:{}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_splits_complete_lines() {
        let mut framer = LineFramer::default();
        let out = framer.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(out, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
    }

    #[test]
    fn framer_keeps_partial_fragment_across_reads() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"{\"jsonrpc\":").is_empty());
        assert!(framer.push(b"\"2.0\"").is_empty());
        let out = framer.push(b",\"id\":1}\n{\"id\"");
        assert_eq!(out, vec![b"{\"jsonrpc\":\"2.0\",\"id\":1}".to_vec()]);
        let out = framer.push(b":2}\r\n");
        assert_eq!(out, vec![b"{\"id\":2}".to_vec()]);
    }

    #[test]
    fn framer_skips_blank_lines_and_flushes_tail() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"\n\r\n   \n").is_empty());
        assert!(framer.push(b"{\"tail\":true}").is_empty());
        assert_eq!(framer.finish(), Some(b"{\"tail\":true}".to_vec()));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn framer_discards_oversized_line_and_resyncs() {
        let mut framer = LineFramer::new(8);
        assert!(framer.push(b"0123456789").is_empty());
        assert!(framer.push(b"abcdef").is_empty());
        let out = framer.push(b"xyz\n{\"ok\":1}\n");
        // `{"ok":1}` is exactly 8 bytes, so it survives.
        assert_eq!(out, vec![b"{\"ok\":1}".to_vec()]);
    }

    #[test]
    fn sse_decoder_emits_on_blank_line() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push_line("event: endpoint\n"), None);
        assert_eq!(decoder.push_line("data: /messages?session=1\n"), None);
        let event = decoder.push_line("\n").unwrap();
        assert_eq!(event.event.as_deref(), Some("endpoint"));
        assert_eq!(event.data, "/messages?session=1");
    }

    #[test]
    fn sse_decoder_joins_multiline_data_and_ignores_comments() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push_line(": keep-alive"), None);
        decoder.push_line("data: first");
        decoder.push_line("data:second");
        let event = decoder.push_line("").unwrap();
        assert_eq!(event.event, None);
        assert_eq!(event.data, "first\nsecond");
        // An event with no data is not dispatched.
        decoder.push_line("event: ping");
        assert_eq!(decoder.push_line(""), None);
    }

    #[test]
    fn sse_decoder_finish_flushes_pending_event() {
        let mut decoder = SseDecoder::new();
        decoder.push_line("data: [DONE]");
        assert_eq!(decoder.finish().map(|e| e.data), Some("[DONE]".to_string()));
    }

    #[tokio::test]
    async fn channel_pair_delivers_both_ways() {
        let (client, server) = ChannelTransport::pair("test");
        let mut server_rx = server.receive().unwrap();
        let mut client_rx = client.receive().unwrap();
        assert!(server.receive().is_none());

        client.send(b"ping".to_vec()).unwrap();
        assert_eq!(server_rx.recv().await.unwrap(), b"ping".to_vec());
        server.send(b"pong".to_vec()).unwrap();
        assert_eq!(client_rx.recv().await.unwrap(), b"pong".to_vec());
    }

    #[tokio::test]
    async fn closed_channel_rejects_sends_and_ends_peer_stream() {
        let (client, server) = ChannelTransport::pair("test");
        let mut server_rx = server.receive().unwrap();
        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.send(b"x".to_vec()), Err(TransportError::Closed)));
        assert_eq!(server_rx.recv().await, None);
    }

    #[tokio::test]
    async fn stdio_spawn_failure_is_typed() {
        let result = StdioTransport::spawn(
            "/nonexistent/vireo-mcp-server",
            &[],
            &HashMap::new(),
        );
        assert!(matches!(result, Err(TransportError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdio_round_trips_through_cat() {
        let transport = StdioTransport::spawn("cat", &[], &HashMap::new()).unwrap();
        let mut rx = transport.receive().unwrap();
        transport.send(b"{\"id\":1}".to_vec()).unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, b"{\"id\":1}".to_vec());
        transport.close();
        transport.close();
        assert!(transport.is_closed());
    }

    fn read_request_head(stream: &mut std::net::TcpStream) {
        use std::io::Read;
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(0) | Err(_) => return,
                Ok(_) => head.push(byte[0]),
            }
        }
    }

    /// Accept the event-stream GET and announce `/messages` as the POST target.
    fn accept_event_stream(listener: &std::net::TcpListener) -> std::net::TcpStream {
        use std::io::Write;
        let (mut stream, _) = listener.accept().unwrap();
        read_request_head(&mut stream);
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n\
                  event: endpoint\ndata: /messages\n\n",
            )
            .unwrap();
        stream.flush().unwrap();
        stream
    }

    #[tokio::test]
    async fn sse_failed_post_ends_the_inbound_stream() {
        use std::io::Write;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let stream = accept_event_stream(&listener);
            let (mut post, _) = listener.accept().unwrap();
            read_request_head(&mut post);
            let _ = post.write_all(
                b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            stream
        });

        let transport = SseTransport::connect(&format!("http://{}/sse", addr), None, &HashMap::new())
            .await
            .unwrap();
        let mut inbound = transport.receive().unwrap();
        transport
            .send(br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#.to_vec())
            .unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        let _stream = server.join().unwrap();
    }

    #[tokio::test]
    async fn sse_close_ends_stream_and_releases_the_connection() {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = std::sync::mpsc::channel::<()>();
        let server = std::thread::spawn(move || {
            let mut stream = accept_event_stream(&listener);
            closed_rx.recv().unwrap();
            stream.write_all(b": keep-alive\n").unwrap();
            stream.flush().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 16];
            stream.read(&mut buf)
        });

        let transport = SseTransport::connect(&format!("http://{}/sse", addr), None, &HashMap::new())
            .await
            .unwrap();
        let mut inbound = transport.receive().unwrap();
        transport.close();

        // No server traffic is needed for the reader to see the end.
        let end = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        assert!(matches!(transport.send(b"{}".to_vec()), Err(TransportError::Closed)));

        closed_tx.send(()).unwrap();
        let read = tokio::task::spawn_blocking(move || server.join().unwrap())
            .await
            .unwrap();
        assert!(
            matches!(read, Ok(0)) || matches!(&read, Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset),
            "connection still open: {:?}",
            read
        );
    }

    #[tokio::test]
    async fn sse_rejects_non_http_urls() {
        let result = SseTransport::connect("ftp://example.com/sse", None, &HashMap::new()).await;
        assert!(matches!(result, Err(TransportError::InvalidEndpoint(_))));
        let result = SseTransport::connect("not a url", None, &HashMap::new()).await;
        assert!(matches!(result, Err(TransportError::InvalidEndpoint(_))));
    }
}
