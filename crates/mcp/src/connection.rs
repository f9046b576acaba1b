// Per-session protocol connection: inbound dispatch plus sampling correlation

use crate::protocol::{
    CreateMessageParams, CreateMessageResult, InitializeResult, JsonRpcError, JsonRpcMessage,
    JsonRpcRequest, JsonRpcResponse, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, OutboundFrame, PromptsCapability, ReadResourceParams,
    ReadResourceResult, ResourcesCapability, ServerCapabilities, ServerInfo, ToolsCapability,
    CallToolParams, GetPromptParams, PROTOCOL_VERSION,
};
use crate::registry::{CapabilityRegistry, Sampler, SamplingError};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

/// One protocol connection, bound to a single client session
///
/// Outbound frames are drained by the session's event stream; inbound frames
/// arrive through [`McpConnection::handle_message`]. Each inbound request is
/// dispatched as its own task so a tool awaiting a sampling round-trip never
/// blocks the delivery path that will carry the agent's reply.
pub struct McpConnection {
    registry: Arc<CapabilityRegistry>,
    outbound: mpsc::Sender<OutboundFrame>,
    // Server-initiated requests (sampling) parked until the client replies
    pending: Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
    next_request_id: AtomicI64,
    sampling_timeout: Duration,
    server_info: ServerInfo,
}

impl McpConnection {
    /// Build a connection and the receiver its session stream drains
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        sampling_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::channel(32);
        let connection = Arc::new(Self {
            registry,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicI64::new(1),
            sampling_timeout,
            server_info: ServerInfo {
                name: "roster".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        });
        (connection, rx)
    }

    /// Handle one raw inbound frame
    ///
    /// Returns `Err` only when the frame is not parseable JSON-RPC; that is
    /// a transport-level rejection, everything else is answered in-protocol.
    pub async fn handle_message(self: &Arc<Self>, text: &str) -> Result<(), serde_json::Error> {
        match serde_json::from_str::<JsonRpcMessage>(text)? {
            JsonRpcMessage::Request(request) => {
                if request.is_notification() {
                    tracing::debug!("Notification: {}", request.method);
                    return Ok(());
                }
                let connection = self.clone();
                tokio::spawn(async move {
                    let response = connection.dispatch(request).await;
                    connection.send_frame(OutboundFrame::Response(response)).await;
                });
            }
            JsonRpcMessage::Response(response) => {
                self.complete_pending(response).await;
            }
        }
        Ok(())
    }

    /// Route a client reply to the sampling call waiting on it
    async fn complete_pending(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.as_i64() else {
            tracing::debug!("Dropping reply with non-numeric id: {}", response.id);
            return;
        };
        let waiter = self.pending.lock().await.remove(&id);
        match waiter {
            Some(tx) => {
                // The waiter may have timed out already; nothing left to do then
                let _ = tx.send(response);
            }
            None => tracing::debug!("Dropping reply for unknown request id {}", id),
        }
    }

    async fn send_frame(&self, frame: OutboundFrame) {
        if self.outbound.send(frame).await.is_err() {
            tracing::debug!("Session stream closed, dropping outbound frame");
        }
    }

    async fn dispatch(self: &Arc<Self>, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone().unwrap_or(serde_json::Value::Null);
        tracing::debug!("Dispatching {}", request.method);

        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(id, self.initialize_result()),
            "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
            "resources/list" => JsonRpcResponse::success(
                id,
                ListResourcesResult {
                    resources: self.registry.list_resources(),
                },
            ),
            "resources/templates/list" => JsonRpcResponse::success(
                id,
                ListResourceTemplatesResult {
                    resource_templates: self.registry.list_resource_templates(),
                },
            ),
            "resources/read" => match parse_params::<ReadResourceParams>(request.params) {
                Ok(params) => self.read_resource(id, params).await,
                Err(err) => JsonRpcResponse::error(id, err),
            },
            "tools/list" => JsonRpcResponse::success(
                id,
                ListToolsResult {
                    tools: self.registry.list_tools(),
                },
            ),
            "tools/call" => match parse_params::<CallToolParams>(request.params) {
                Ok(params) => self.call_tool(id, params).await,
                Err(err) => JsonRpcResponse::error(id, err),
            },
            "prompts/list" => JsonRpcResponse::success(
                id,
                ListPromptsResult {
                    prompts: self.registry.list_prompts(),
                },
            ),
            "prompts/get" => match parse_params::<GetPromptParams>(request.params) {
                Ok(params) => self.get_prompt(id, params),
                Err(err) => JsonRpcResponse::error(id, err),
            },
            method => {
                JsonRpcResponse::error(id, JsonRpcError::method_not_found(method))
            }
        }
    }

    fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                resources: Some(ResourcesCapability::default()),
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                prompts: Some(PromptsCapability::default()),
            },
            server_info: self.server_info.clone(),
        }
    }

    async fn read_resource(
        &self,
        id: serde_json::Value,
        params: ReadResourceParams,
    ) -> JsonRpcResponse {
        let Some((resource, bindings)) = self.registry.resolve_resource(&params.uri) else {
            return JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_params(format!("Unknown resource: {}", params.uri)),
            );
        };

        match resource.read(&params.uri, &bindings).await {
            Ok(contents) => JsonRpcResponse::success(
                id,
                ReadResourceResult {
                    contents: vec![contents],
                },
            ),
            Err(err) => {
                tracing::error!("Resource read failed for {}: {:#}", params.uri, err);
                JsonRpcResponse::error(id, JsonRpcError::internal_error(err.to_string()))
            }
        }
    }

    async fn call_tool(self: &Arc<Self>, id: serde_json::Value, params: CallToolParams) -> JsonRpcResponse {
        let sampler: &dyn Sampler = self.as_ref();
        match self
            .registry
            .call_tool(&params.name, params.arguments, sampler)
            .await
        {
            Some(result) => JsonRpcResponse::success(id, result),
            None => JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_params(format!("Unknown tool: {}", params.name)),
            ),
        }
    }

    fn get_prompt(&self, id: serde_json::Value, params: GetPromptParams) -> JsonRpcResponse {
        let Some(prompt) = self.registry.find_prompt(&params.name) else {
            return JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_params(format!("Unknown prompt: {}", params.name)),
            );
        };

        match prompt.get(&params.arguments) {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(err) => JsonRpcResponse::error(id, JsonRpcError::invalid_params(err.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl Sampler for McpConnection {
    /// Nested generation request to the connected agent
    ///
    /// Correlated by request id with the reply delivered through
    /// [`McpConnection::handle_message`]; waits are bounded by the
    /// configured sampling timeout, with no retry.
    async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult, SamplingError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, "sampling/createMessage", &params);
        if self
            .outbound
            .send(OutboundFrame::Request(request))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(SamplingError::ConnectionClosed);
        }

        let reply = match tokio::time::timeout(self.sampling_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SamplingError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!("Sampling request {} timed out", id);
                return Err(SamplingError::Timeout);
            }
        };

        if let Some(err) = reply.error {
            return Err(SamplingError::ErrorReply(err.message));
        }
        let result = reply
            .result
            .ok_or_else(|| SamplingError::MalformedReply("reply has no result".to_string()))?;
        serde_json::from_value(result).map_err(|err| SamplingError::MalformedReply(err.to_string()))
    }
}

fn parse_params<T: DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> Result<T, JsonRpcError> {
    let params = params.unwrap_or_else(|| serde_json::json!({}));
    serde_json::from_value(params).map_err(|err| JsonRpcError::invalid_params(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageContent;

    fn test_connection() -> (Arc<McpConnection>, mpsc::Receiver<OutboundFrame>) {
        McpConnection::new(
            Arc::new(CapabilityRegistry::new()),
            Duration::from_secs(5),
        )
    }

    async fn next_response(rx: &mut mpsc::Receiver<OutboundFrame>) -> JsonRpcResponse {
        match rx.recv().await.expect("frame") {
            OutboundFrame::Response(response) => response,
            OutboundFrame::Request(request) => panic!("unexpected request: {}", request.method),
        }
    }

    #[tokio::test]
    async fn test_initialize_advertises_capabilities() {
        let (connection, mut rx) = test_connection();

        connection
            .handle_message(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"test","version":"0"}}}"#,
            )
            .await
            .unwrap();

        let response = next_response(&mut rx).await;
        let result = response.result.unwrap();
        assert!(result["capabilities"].get("resources").is_some());
        assert!(result["capabilities"].get("tools").is_some());
        assert!(result["capabilities"].get("prompts").is_some());
        assert_eq!(result["serverInfo"]["name"], "roster");
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected_in_protocol() {
        let (connection, mut rx) = test_connection();

        connection
            .handle_message(r#"{"jsonrpc":"2.0","id":2,"method":"users/teleport"}"#)
            .await
            .unwrap();

        let response = next_response(&mut rx).await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_unparseable_frame_is_transport_error() {
        let (connection, _rx) = test_connection();
        assert!(connection.handle_message("not json").await.is_err());
    }

    #[tokio::test]
    async fn test_sampling_round_trip() {
        let (connection, mut rx) = test_connection();

        let sampler = connection.clone();
        let call = tokio::spawn(async move {
            sampler
                .create_message(CreateMessageParams::user_text("Generate something", 64))
                .await
        });

        // The connection emits the nested request over the session stream
        let request = match rx.recv().await.expect("frame") {
            OutboundFrame::Request(request) => request,
            OutboundFrame::Response(_) => panic!("expected sampling request"),
        };
        assert_eq!(request.method, "sampling/createMessage");
        let request_id = request.id.unwrap();

        // Client posts its reply back in, correlated by id
        let reply = serde_json::json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "result": {"content": {"type": "text", "text": "hello"}}
        });
        connection
            .handle_message(&reply.to_string())
            .await
            .unwrap();

        let result = call.await.unwrap().unwrap();
        match result.content {
            MessageContent::Text { text } => assert_eq!(text, "hello"),
            MessageContent::Image { .. } => panic!("expected text content"),
        }
    }

    #[tokio::test]
    async fn test_sampling_error_reply() {
        let (connection, mut rx) = test_connection();

        let sampler = connection.clone();
        let call = tokio::spawn(async move {
            sampler
                .create_message(CreateMessageParams::user_text("Generate something", 64))
                .await
        });

        let request = match rx.recv().await.expect("frame") {
            OutboundFrame::Request(request) => request,
            OutboundFrame::Response(_) => panic!("expected sampling request"),
        };
        let reply = serde_json::json!({
            "jsonrpc": "2.0",
            "id": request.id.unwrap(),
            "error": {"code": -1, "message": "sampling unsupported"}
        });
        connection.handle_message(&reply.to_string()).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SamplingError::ErrorReply(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_wait_is_bounded() {
        let (connection, mut rx) = McpConnection::new(
            Arc::new(CapabilityRegistry::new()),
            Duration::from_millis(100),
        );

        let sampler = connection.clone();
        let call = tokio::spawn(async move {
            sampler
                .create_message(CreateMessageParams::user_text("Generate something", 64))
                .await
        });

        // Drain the outgoing request but never reply
        let _ = rx.recv().await.expect("frame");

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SamplingError::Timeout));
        assert!(connection.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_reply_for_unknown_id_is_dropped() {
        let (connection, _rx) = test_connection();
        connection
            .handle_message(r#"{"jsonrpc":"2.0","id":999,"result":{}}"#)
            .await
            .unwrap();
        assert!(connection.pending.lock().await.is_empty());
    }
}
