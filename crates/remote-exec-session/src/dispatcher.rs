//! Request handler exposing the `execute_command` tool.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use remote_exec_core::{
    MethodCall, Notification, RpcError,
    protocol::{
        CallToolParams, CallToolResult, Content, Implementation, InitializeParams, InitializeResult,
        ListToolsResult, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS, ToolDescriptor, methods,
    },
};
use remote_exec_executor::{CommandRequest, ExecutionEngine};
use serde_json::{Value, json};

use crate::RequestHandler;

/// Name of the single tool this server offers.
pub const EXECUTE_COMMAND: &str = "execute_command";

/// Routes tool requests into an [`ExecutionEngine`].
pub struct ToolDispatcher {
    engine: Arc<ExecutionEngine>,
    server_info: Implementation,
    initialized: AtomicBool,
}

impl ToolDispatcher {
    #[must_use]
    pub fn new(engine: Arc<ExecutionEngine>, server_info: Implementation) -> Self {
        Self {
            engine,
            server_info,
            initialized: AtomicBool::new(false),
        }
    }

    /// Whether the peer has sent `notifications/initialized`.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Descriptor advertised by `tools/list`.
    #[must_use]
    pub fn execute_command_tool() -> ToolDescriptor {
        ToolDescriptor {
            name: EXECUTE_COMMAND.to_owned(),
            description: "Run a single-line shell command on the host under the configured command \
                          policy. Foreground runs are limited to 30 seconds and 2 MiB of output per \
                          stream; background runs return immediately."
                .to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Single-line shell command" },
                    "explanation": { "type": "string", "description": "Why the command is needed" },
                    "background": { "type": "boolean", "default": false },
                    "requireApproval": { "type": "boolean", "default": false }
                },
                "required": ["command"]
            }),
        }
    }

    fn initialize(&self, params: &InitializeParams) -> InitializeResult {
        let protocol_version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
            params.protocol_version.clone()
        } else {
            PROTOCOL_VERSION.to_owned()
        };
        tracing::info!(
            client = %params.client_info.name,
            version = %params.client_info.version,
            protocol = %protocol_version,
            "Client connected"
        );
        InitializeResult {
            protocol_version,
            capabilities: json!({ "tools": {} }),
            server_info: self.server_info.clone(),
            instructions: None,
        }
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult, RpcError> {
        if params.name != EXECUTE_COMMAND {
            return Err(RpcError::invalid_params(format!("unknown tool: {}", params.name)));
        }

        let request: CommandRequest = serde_json::from_value(params.arguments).map_err(RpcError::invalid_params)?;
        request.validate().map_err(RpcError::invalid_params)?;

        tracing::info!(
            command = %request.command,
            explanation = %request.explanation,
            background = request.background,
            "Executing command"
        );
        let outcome = self.engine.execute(request).await;

        let structured = serde_json::to_value(&outcome).map_err(RpcError::internal)?;
        Ok(CallToolResult {
            content: vec![Content::Text {
                text: structured.to_string(),
            }],
            is_error: outcome.is_error(),
            structured_content: Some(structured),
        })
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(RpcError::internal)
}

#[async_trait]
impl RequestHandler for ToolDispatcher {
    async fn handle_request(&self, call: MethodCall) -> Result<Value, RpcError> {
        match call {
            MethodCall::Initialize(params) => to_value(&self.initialize(&params)),
            MethodCall::Ping => Ok(json!({})),
            MethodCall::ListTools => to_value(&ListToolsResult {
                tools: vec![Self::execute_command_tool()],
            }),
            MethodCall::CallTool(params) => to_value(&self.call_tool(params).await?),
            MethodCall::Other { method, .. } => Err(RpcError::method_not_found(&method)),
        }
    }

    async fn handle_notification(&self, notification: Notification) {
        if notification.method == methods::INITIALIZED {
            self.initialized.store(true, Ordering::Release);
            tracing::info!("Client initialized");
        } else {
            tracing::debug!(method = %notification.method, "Ignoring notification");
        }
    }
}
