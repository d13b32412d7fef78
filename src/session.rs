//! Per-connection protocol session.
//!
//! A session speaks newline-delimited JSON-RPC over its transport. The first
//! message must be `initialize`; the client name it carries is the peer
//! identity handed to the approval coordinator. Nothing is answered until the
//! peer is approved, and a denied peer only sees the connection close.
//!
//! ```text
//! created -> handshaking -> awaiting_approval -> active -> closing -> closed
//!    \___________\__________________\______________________/
//!                  rejection, error or timeout
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::{ApprovalCoordinator, ApprovalError, PeerIdentity};
use crate::capability::CapabilityError;
use crate::manager::ToolCatalog;
use crate::mcp::protocol::{
    self, methods, CallToolParams, InitializeParams, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ReadResourceParams, ServerInfo,
};
use crate::mcp::{tool_result, CallToolResult};

/// How often an active session checks its transport.
pub const SESSION_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Limits on what an unapproved peer may queue while the prompt is open.
const MAX_PENDING_FRAMES: usize = 32;
const MAX_PENDING_BYTES: usize = 256 * 1024;

type Frames = FramedRead<Box<dyn AsyncRead + Send + Unpin>, LinesCodec>;

/// Unique per accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Handshaking,
    AwaitingApproval,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Handshaking => "handshaking",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Open,
    Cancelled,
    Failed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Peer closed the connection")]
    Disconnected,

    #[error("Transport error: {0}")]
    Transport(#[from] LinesCodecError),

    #[error("Invalid handshake: {0}")]
    Handshake(String),

    #[error("Peer {0} was not approved")]
    Denied(PeerIdentity),

    #[error("Peer sent too much before approval")]
    BacklogOverflow,

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("Session cancelled")]
    Cancelled,
}

/// Byte stream a session runs over.
pub struct Transport {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    peer: String,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.into(),
        }
    }

    pub fn tcp(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, addr.to_string())
    }

    /// Remote address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("peer", &self.peer).finish()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub health_interval: Duration,
    pub server_info: ServerInfo,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            health_interval: SESSION_HEALTH_INTERVAL,
            server_info: ServerInfo::default(),
        }
    }
}

/// The manager's view of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: ConnectionId,
    peer: String,
    state: watch::Receiver<SessionState>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Queue a `tools/list_changed` notification. Only active sessions get one.
    pub fn notify_tools_changed(&self) -> bool {
        if !self.state().is_active() {
            return false;
        }
        match protocol::to_line(&JsonRpcNotification::tools_list_changed()) {
            Ok(line) => self.outbound.send(line).is_ok(),
            Err(e) => {
                tracing::warn!("Failed to encode notification: {}", e);
                false
            }
        }
    }

    /// Ask the session to close its transport and exit.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

struct Context {
    id: ConnectionId,
    peer: String,
    catalog: Arc<ToolCatalog>,
    approvals: ApprovalCoordinator,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

/// One accepted connection, consumed by [`Session::run`].
pub struct Session {
    ctx: Context,
    transport: Transport,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        transport: Transport,
        catalog: Arc<ToolCatalog>,
        approvals: ApprovalCoordinator,
        config: SessionConfig,
    ) -> (Self, SessionHandle) {
        let (state_tx, state_rx) = watch::channel(SessionState::Created);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let peer = transport.peer().to_string();

        let handle = SessionHandle {
            id,
            peer: peer.clone(),
            state: state_rx,
            outbound: outbound_tx.clone(),
            cancel: cancel.clone(),
        };
        let session = Self {
            ctx: Context {
                id,
                peer,
                catalog,
                approvals,
                config,
                state: state_tx,
                outbound: outbound_tx,
                cancel,
            },
            transport,
            outbound: outbound_rx,
        };
        (session, handle)
    }

    /// Drive the session until the peer leaves, it is stopped or it fails.
    /// The transport is closed before this returns.
    pub async fn run(self) -> Result<(), SessionError> {
        let Session {
            ctx,
            transport,
            outbound,
        } = self;
        let Transport { reader, writer, .. } = transport;

        let (transport_tx, transport_rx) = watch::channel(TransportState::Open);
        let sink = FramedWrite::new(writer, LinesCodec::new());
        let writer = tokio::spawn(write_loop(sink, outbound, ctx.cancel.clone(), transport_tx));
        let mut frames: Frames = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

        let result = ctx.drive(&mut frames, transport_rx).await;
        match &result {
            Ok(()) => tracing::info!(connection = %ctx.id, "Peer {} disconnected", ctx.peer),
            Err(SessionError::Denied(identity)) => {
                tracing::info!(connection = %ctx.id, "Connection from {} denied", identity)
            }
            Err(e @ SessionError::BacklogOverflow) => {
                tracing::warn!(connection = %ctx.id, "Closing {}: {}", ctx.peer, e)
            }
            Err(e) => tracing::debug!(connection = %ctx.id, "Session ended: {}", e),
        }

        ctx.state.send_replace(SessionState::Closing);
        ctx.cancel.cancel();
        drop(frames);
        if let Err(e) = writer.await {
            tracing::warn!("Session writer task failed: {}", e);
        }
        ctx.state.send_replace(SessionState::Closed);
        result
    }
}

impl Context {
    fn set_state(&self, state: SessionState) {
        tracing::debug!(connection = %self.id, "Session {}", state);
        self.state.send_replace(state);
    }

    fn send<T: Serialize>(&self, message: &T) {
        match protocol::to_line(message) {
            Ok(line) => {
                let _ = self.outbound.send(line);
            }
            Err(e) => tracing::error!("Failed to encode message: {}", e),
        }
    }

    async fn drive(
        &self,
        frames: &mut Frames,
        transport: watch::Receiver<TransportState>,
    ) -> Result<(), SessionError> {
        let (request, params) = self.handshake(frames).await?;
        let identity = PeerIdentity::new(params.client_info.name.trim());

        self.set_state(SessionState::AwaitingApproval);
        let mut backlog = Vec::new();
        let approved = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            decision = self.approvals.decide(&identity) => decision?,
            closed = buffer_until_closed(frames, &mut backlog) => return Err(closed),
        };
        if !approved {
            return Err(SessionError::Denied(identity));
        }

        let result = protocol::initialize_result(
            &self.config.server_info,
            params.protocol_version.as_deref(),
        );
        self.send(&JsonRpcResponse::success(
            request.id.unwrap_or(Value::Null),
            result,
        ));
        self.set_state(SessionState::Active);
        tracing::info!(connection = %self.id, peer = %identity, "Session active");

        let health = tokio::spawn(health_loop(
            transport,
            self.cancel.clone(),
            self.config.health_interval,
        ));
        let result = self.serve(frames, backlog).await;
        health.abort();
        result
    }

    async fn handshake(
        &self,
        frames: &mut Frames,
    ) -> Result<(JsonRpcRequest, InitializeParams), SessionError> {
        let line = loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => break line,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SessionError::Disconnected),
            }
        };
        self.set_state(SessionState::Handshaking);

        let request: JsonRpcRequest = serde_json::from_str(&line)
            .map_err(|e| SessionError::Handshake(format!("unparseable message: {}", e)))?;
        if request.method != methods::INITIALIZE {
            return Err(SessionError::Handshake(format!(
                "expected initialize, got {}",
                request.method
            )));
        }
        if request.is_notification() {
            return Err(SessionError::Handshake("initialize sent without an id".into()));
        }
        let params: InitializeParams = serde_json::from_value(request.params.clone())
            .map_err(|e| SessionError::Handshake(format!("bad initialize params: {}", e)))?;
        if params.client_info.name.trim().is_empty() {
            return Err(SessionError::Handshake("empty client name".into()));
        }
        Ok((request, params))
    }

    async fn serve(&self, frames: &mut Frames, backlog: Vec<String>) -> Result<(), SessionError> {
        for line in backlog {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = self.handle_line(&line) => {}
            }
        }

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                frame = frames.next() => frame,
            };
            let line = match frame {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = self.handle_line(&line) => {}
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                self.send(&JsonRpcResponse::error(
                    Value::Null,
                    protocol::PARSE_ERROR,
                    e.to_string(),
                ));
                return;
            }
        };
        if request.is_notification() {
            tracing::debug!(connection = %self.id, "Notification {}", request.method);
            return;
        }
        let response = self.dispatch(request).await;
        self.send(&response);
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            methods::INITIALIZE => JsonRpcResponse::error(
                id,
                protocol::INVALID_REQUEST,
                "Session already initialized",
            ),
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::TOOLS_LIST => {
                JsonRpcResponse::success(id, json!({ "tools": self.catalog.list_tools() }))
            }
            methods::TOOLS_CALL => {
                // Tool failures, bad arguments included, are results rather than faults.
                let result = match serde_json::from_value::<CallToolParams>(request.params) {
                    Ok(params) => {
                        tracing::debug!(connection = %self.id, "tools/call {}", params.name);
                        let arguments = params.arguments.unwrap_or_else(|| json!({}));
                        tool_result(self.catalog.call_tool(&params.name, arguments).await)
                    }
                    Err(e) => CallToolResult::error(format!("Invalid tools/call params: {}", e)),
                };
                match serde_json::to_value(result) {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::error(id, protocol::INTERNAL_ERROR, e.to_string()),
                }
            }
            methods::RESOURCES_LIST => JsonRpcResponse::success(id, json!({ "resources": [] })),
            methods::RESOURCES_TEMPLATES_LIST => JsonRpcResponse::success(
                id,
                json!({ "resourceTemplates": self.catalog.resource_templates() }),
            ),
            methods::RESOURCES_READ => {
                let params: ReadResourceParams = match serde_json::from_value(request.params) {
                    Ok(params) => params,
                    Err(e) => return JsonRpcResponse::error(id, protocol::INVALID_PARAMS, e.to_string()),
                };
                match self.catalog.read_resource(&params.uri).await {
                    Ok(content) => JsonRpcResponse::success(id, json!({ "contents": [content] })),
                    Err(e @ CapabilityError::ResourceNotFound(_)) => {
                        JsonRpcResponse::error(id, protocol::RESOURCE_NOT_FOUND, e.to_string())
                    }
                    Err(e) => JsonRpcResponse::error(id, protocol::INTERNAL_ERROR, e.to_string()),
                }
            }
            methods::PROMPTS_LIST => JsonRpcResponse::success(id, json!({ "prompts": [] })),
            other => JsonRpcResponse::error(
                id,
                protocol::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        }
    }
}

/// Hold frames that arrive while approval is pending. Returns once the peer
/// goes away or queues more than the pending limits allow.
async fn buffer_until_closed(frames: &mut Frames, backlog: &mut Vec<String>) -> SessionError {
    let mut bytes = 0;
    loop {
        match frames.next().await {
            Some(Ok(line)) if line.trim().is_empty() => {}
            Some(Ok(line)) => {
                bytes += line.len();
                if backlog.len() >= MAX_PENDING_FRAMES || bytes > MAX_PENDING_BYTES {
                    return SessionError::BacklogOverflow;
                }
                backlog.push(line);
            }
            Some(Err(e)) => return e.into(),
            None => return SessionError::Disconnected,
        }
    }
}

async fn write_loop(
    mut sink: FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    transport: watch::Sender<TransportState>,
) {
    loop {
        // Queued messages are flushed before a cancellation is honoured.
        let line = tokio::select! {
            biased;
            line = outbound.recv() => match line {
                Some(line) => line,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        if let Err(e) = sink.send(line).await {
            tracing::debug!("Write failed: {}", e);
            transport.send_replace(TransportState::Failed);
            return;
        }
    }
    if let Err(e) = SinkExt::<String>::close(&mut sink).await {
        tracing::debug!("Failed to close transport: {}", e);
    }
    transport.send_replace(TransportState::Cancelled);
}

async fn health_loop(
    transport: watch::Receiver<TransportState>,
    cancel: CancellationToken,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let state = *transport.borrow();
        if state != TransportState::Open {
            tracing::warn!("Transport {:?}, tearing down session", state);
            cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::approval::tests::{wait_until, CountingNotifier, ScriptedPrompt};
    use crate::approval::{ApprovalConfig, ApprovalDecision};
    use crate::capability::{flag, CapabilityBindings, CapabilityRegistry, EchoProvider};
    use crate::settings::SettingsStore;
    use tempfile::TempDir;
    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
    };
    use tokio::task::JoinHandle;

    /// Writer whose every write fails, as after the peer's socket breaks.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    /// Client end of an in-memory transport.
    pub(crate) struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        pub(crate) async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        pub(crate) async fn send(&mut self, message: Value) {
            self.send_raw(&message.to_string()).await;
        }

        pub(crate) async fn recv(&mut self) -> Option<Value> {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for the session")
                .unwrap()
                .map(|line| serde_json::from_str(&line).unwrap())
        }

        pub(crate) async fn initialize(&mut self, name: &str) {
            self.send(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-03-26",
                    "clientInfo": { "name": name, "version": "1.0" },
                    "capabilities": {}
                }
            }))
            .await;
        }
    }

    struct Fixture {
        _temp: TempDir,
        prompt: Arc<ScriptedPrompt>,
        approvals: ApprovalCoordinator,
        catalog: Arc<ToolCatalog>,
    }

    async fn fixture(prompt: ScriptedPrompt) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::new(temp.path()).await);
        let prompt = Arc::new(prompt);
        let approvals = ApprovalCoordinator::spawn(
            settings,
            prompt.clone(),
            Arc::new(CountingNotifier::default()),
            ApprovalConfig::default(),
        );

        let registry = CapabilityRegistry::new().with_provider(Arc::new(EchoProvider {
            id: "calendar",
            tools: vec!["events"],
        }));
        let (_flag, accessor) = flag(true);
        let bindings: CapabilityBindings = [("calendar".to_string(), accessor)].into();
        let catalog = Arc::new(ToolCatalog::new(registry, true, bindings));

        Fixture {
            _temp: temp,
            prompt,
            approvals,
            catalog,
        }
    }

    pub(crate) fn duplex_peer() -> (Peer, Transport) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let (client_reader, client_writer) = tokio::io::split(client);
        let peer = Peer {
            lines: BufReader::new(client_reader).lines(),
            writer: client_writer,
        };
        (peer, Transport::new(reader, writer, "test-peer"))
    }

    fn open(fixture: &Fixture) -> (Peer, SessionHandle, JoinHandle<Result<(), SessionError>>) {
        let (peer, transport) = duplex_peer();
        let (session, handle) = Session::new(
            ConnectionId::new(),
            transport,
            fixture.catalog.clone(),
            fixture.approvals.clone(),
            SessionConfig::default(),
        );
        (peer, handle, tokio::spawn(session.run()))
    }

    #[tokio::test]
    async fn test_approved_session_serves_methods() {
        let fixture = fixture(ScriptedPrompt::answering(ApprovalDecision::Approve)).await;
        let (mut peer, handle, task) = open(&fixture);

        peer.initialize("Agent-A").await;
        let response = peer.recv().await.unwrap();
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], true);
        wait_until(|| handle.state() == SessionState::Active).await;

        peer.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        let tools = peer.recv().await.unwrap();
        assert_eq!(tools["id"], 2);
        assert_eq!(tools["result"]["tools"][0]["name"], "events");
        assert_eq!(tools["result"]["tools"][0]["annotations"]["readOnlyHint"], true);

        peer.send(json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "events", "arguments": {}}
        }))
        .await;
        let call = peer.recv().await.unwrap();
        assert_eq!(call["result"]["isError"], false);
        assert_eq!(call["result"]["structuredContent"]["provider"], "calendar");

        peer.send(json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": {"name": "missing"}
        }))
        .await;
        let missing = peer.recv().await.unwrap();
        assert!(missing.get("error").is_none());
        assert_eq!(missing["result"]["isError"], true);
        assert!(missing["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Tool not found or service not enabled"));

        peer.send(json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}))
            .await;
        assert_eq!(peer.recv().await.unwrap()["result"]["resources"], json!([]));

        peer.send(json!({"jsonrpc": "2.0", "id": 6, "method": "prompts/list"}))
            .await;
        assert_eq!(peer.recv().await.unwrap()["result"]["prompts"], json!([]));

        peer.send(json!({"jsonrpc": "2.0", "id": 7, "method": "ping"})).await;
        assert_eq!(peer.recv().await.unwrap()["result"], json!({}));

        peer.send(json!({"jsonrpc": "2.0", "id": null, "method": "ping"})).await;
        let null_id = peer.recv().await.unwrap();
        assert_eq!(null_id["id"], Value::Null);
        assert_eq!(null_id["result"], json!({}));

        peer.send(json!({
            "jsonrpc": "2.0", "id": 9, "method": "tools/call",
            "params": {"arguments": {}}
        }))
        .await;
        let bad_params = peer.recv().await.unwrap();
        assert_eq!(bad_params["id"], 9);
        assert!(bad_params.get("error").is_none());
        assert_eq!(bad_params["result"]["isError"], true);

        peer.send(json!({"jsonrpc": "2.0", "id": 8, "method": "bogus"})).await;
        assert_eq!(
            peer.recv().await.unwrap()["error"]["code"],
            protocol::METHOD_NOT_FOUND
        );

        peer.send_raw("{not json").await;
        let parse = peer.recv().await.unwrap();
        assert_eq!(parse["error"]["code"], protocol::PARSE_ERROR);
        assert_eq!(parse["id"], Value::Null);

        drop(peer);
        assert!(task.await.unwrap().is_ok());
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_handshake_closes_without_prompt() {
        let fixture = fixture(ScriptedPrompt::manual()).await;
        let (mut peer, _handle, task) = open(&fixture);

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await;
        assert!(peer.recv().await.is_none());
        assert!(matches!(task.await.unwrap(), Err(SessionError::Handshake(_))));
        assert_eq!(fixture.prompt.count(), 0);
    }

    #[tokio::test]
    async fn test_empty_client_name_rejected() {
        let fixture = fixture(ScriptedPrompt::manual()).await;
        let (mut peer, _handle, task) = open(&fixture);

        peer.initialize("   ").await;
        assert!(peer.recv().await.is_none());
        assert!(matches!(task.await.unwrap(), Err(SessionError::Handshake(_))));
        assert_eq!(fixture.prompt.count(), 0);
    }

    #[tokio::test]
    async fn test_denied_peer_sees_only_close() {
        let fixture = fixture(ScriptedPrompt::answering(ApprovalDecision::Deny)).await;
        let (mut peer, handle, task) = open(&fixture);

        peer.initialize("Agent-D").await;
        assert!(peer.recv().await.is_none());
        assert!(matches!(task.await.unwrap(), Err(SessionError::Denied(_))));
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_list_changed_only_reaches_active_sessions() {
        let fixture = fixture(ScriptedPrompt::manual()).await;
        let (mut peer, handle, _task) = open(&fixture);

        peer.initialize("Agent-N").await;
        wait_until(|| fixture.prompt.count() == 1).await;
        assert_eq!(handle.state(), SessionState::AwaitingApproval);
        assert!(!handle.notify_tools_changed());

        fixture
            .prompt
            .last()
            .unwrap()
            .respond(ApprovalDecision::Approve);
        assert_eq!(peer.recv().await.unwrap()["id"], 1);
        wait_until(|| handle.state().is_active()).await;

        assert!(handle.notify_tools_changed());
        let notification = peer.recv().await.unwrap();
        assert_eq!(notification["method"], methods::TOOLS_LIST_CHANGED);
        assert!(notification.get("id").is_none());
    }

    #[tokio::test]
    async fn test_requests_during_approval_are_served_after() {
        let fixture = fixture(ScriptedPrompt::manual()).await;
        let (mut peer, _handle, _task) = open(&fixture);

        peer.initialize("Agent-Q").await;
        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        wait_until(|| fixture.prompt.count() == 1).await;
        fixture
            .prompt
            .last()
            .unwrap()
            .respond(ApprovalDecision::Approve);

        assert_eq!(peer.recv().await.unwrap()["id"], 1);
        assert_eq!(peer.recv().await.unwrap()["id"], 2);
    }

    #[tokio::test]
    async fn test_disconnect_while_awaiting_approval_withdraws_prompt() {
        let fixture = fixture(ScriptedPrompt::manual()).await;
        let (mut peer, _handle, task) = open(&fixture);

        peer.initialize("Agent-W").await;
        wait_until(|| fixture.prompt.count() == 1).await;
        drop(peer);

        assert!(matches!(task.await.unwrap(), Err(SessionError::Disconnected)));
        let request = fixture.prompt.last().unwrap();
        wait_until(|| request.is_resolved()).await;
        assert_eq!(fixture.approvals.pending_prompts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_transport() {
        let fixture = fixture(ScriptedPrompt::answering(ApprovalDecision::Approve)).await;
        let (mut peer, handle, task) = open(&fixture);

        peer.initialize("Agent-S").await;
        peer.recv().await.unwrap();
        handle.stop();

        assert!(matches!(task.await.unwrap(), Err(SessionError::Cancelled)));
        assert!(peer.recv().await.is_none());
    }

    async fn assert_overflow_closes(
        fixture: &Fixture,
        mut peer: Peer,
        task: JoinHandle<Result<(), SessionError>>,
    ) {
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session kept buffering")
            .unwrap();
        assert!(matches!(result, Err(SessionError::BacklogOverflow)));
        assert!(peer.recv().await.is_none());

        let request = fixture.prompt.last().unwrap();
        wait_until(|| request.is_resolved()).await;
        assert_eq!(fixture.approvals.pending_prompts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_flood_before_approval_closes_session() {
        let fixture = fixture(ScriptedPrompt::manual()).await;
        let (mut peer, handle, task) = open(&fixture);

        peer.initialize("Agent-F").await;
        wait_until(|| fixture.prompt.count() == 1).await;
        for id in 0..=MAX_PENDING_FRAMES {
            peer.send(json!({"jsonrpc": "2.0", "id": id + 2, "method": "ping"}))
                .await;
        }

        assert_overflow_closes(&fixture, peer, task).await;
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_pending_frame_closes_session() {
        let fixture = fixture(ScriptedPrompt::manual()).await;
        let (mut peer, _handle, task) = open(&fixture);

        peer.initialize("Agent-G").await;
        wait_until(|| fixture.prompt.count() == 1).await;
        let padding = "x".repeat(MAX_PENDING_BYTES);
        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping", "params": {"pad": padding}}))
            .await;

        assert_overflow_closes(&fixture, peer, task).await;
    }

    #[tokio::test]
    async fn test_failed_transport_tears_down_active_session() {
        let fixture = fixture(ScriptedPrompt::answering(ApprovalDecision::Approve)).await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, _server_writer) = tokio::io::split(server);
        let (client_reader, client_writer) = tokio::io::split(client);
        let mut peer = Peer {
            lines: BufReader::new(client_reader).lines(),
            writer: client_writer,
        };
        let (session, handle) = Session::new(
            ConnectionId::new(),
            Transport::new(reader, BrokenPipe, "broken-peer"),
            fixture.catalog.clone(),
            fixture.approvals.clone(),
            SessionConfig {
                health_interval: Duration::from_millis(50),
                ..SessionConfig::default()
            },
        );
        let task = tokio::spawn(session.run());

        peer.initialize("Agent-H").await;
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session outlived its transport")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(handle.state(), SessionState::Closed);
    }
}
