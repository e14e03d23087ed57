//! MCP tool integration: the minimal surface the routing core consumes.
//!
//! Connection management lives outside the engine; callers hand the manager
//! already-connected clients implementing [`McpClient`]. The manager keeps a
//! name → tool map per client, merges the visible tool descriptors into
//! outgoing requests, and executes tool calls on behalf of the caller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rmcp::model::{CallToolResult, JsonObject, ListToolsResult, Tool as McpTool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::request::{ChatMessage, ModelParams, Request, Tool, ToolCall};

/// Client surface the engine consumes. Mirrors the tool subset of an MCP
/// client session; everything else (resources, prompts, transport) is out of
/// scope here.
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(
        &self,
        cancel: CancellationToken,
    ) -> Result<ListToolsResult, rmcp::ServiceError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, rmcp::ServiceError>;
}

/// Handler for an in-process tool registered with [`McpManager::register_tool`].
pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

pub struct McpClientConfig {
    pub name: String,
    pub client: Arc<dyn McpClient>,
    /// Allowlist; empty means every tool the client lists.
    pub tools_to_execute: Vec<String>,
    /// Denylist; applied after the allowlist.
    pub tools_to_skip: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct McpConfig {
    pub clients: Vec<Arc<McpClientConfig>>,
}

impl std::fmt::Debug for McpClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClientConfig")
            .field("name", &self.name)
            .field("tools_to_execute", &self.tools_to_execute)
            .field("tools_to_skip", &self.tools_to_skip)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpConnectionState {
    Connected,
    Disconnected,
}

/// Snapshot of one managed client, as reported by `get_clients`.
#[derive(Debug, Clone)]
pub struct McpClientInfo {
    pub name: String,
    pub tools: Vec<String>,
    pub state: McpConnectionState,
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("MCP is not configured in this engine instance")]
    NotConfigured,
    #[error("MCP client already exists: {0}")]
    DuplicateClient(String),
    #[error("MCP client not found: {0}")]
    UnknownClient(String),
    #[error("no MCP client serves tool: {0}")]
    UnknownTool(String),
    #[error("tool call is missing a function name")]
    MissingToolName,
    #[error("tool call failed: {0}")]
    Service(#[from] rmcp::ServiceError),
    #[error("tool handler failed: {0}")]
    Handler(#[source] anyhow::Error),
    #[error("tool {0} reported an execution error: {1}")]
    ToolReportedError(String, String),
}

struct ClientState {
    client: Arc<dyn McpClient>,
    tools_to_execute: Vec<String>,
    tools_to_skip: Vec<String>,
    tool_map: HashMap<String, McpTool>,
    connected: bool,
}

impl ClientState {
    fn visible(&self, tool_name: &str) -> bool {
        let allowed = self.tools_to_execute.is_empty()
            || self.tools_to_execute.iter().any(|t| t == tool_name);
        allowed && !self.tools_to_skip.iter().any(|t| t == tool_name)
    }
}

struct LocalTool {
    handler: ToolHandler,
    descriptor: Tool,
}

/// Tool-server manager. Management operations take the client map write lock
/// and may briefly delay enrichment of new requests, but workers never touch
/// the manager, so dispatch can never deadlock behind it.
#[derive(Default)]
pub struct McpManager {
    clients: RwLock<HashMap<String, ClientState>>,
    local_tools: RwLock<HashMap<String, LocalTool>>,
}

impl McpManager {
    pub fn new() -> Self {
        McpManager::default()
    }

    /// Builds a manager from configuration, fetching each client's tool list.
    /// A client whose listing fails is kept as disconnected rather than
    /// failing engine startup.
    pub async fn from_config(config: McpConfig) -> Self {
        let manager = McpManager::new();
        for client_config in config.clients {
            if let Err(err) = manager.add_client_config(&client_config).await {
                warn!("failed to initialize MCP client {}: {err}", client_config.name);
            }
        }
        manager
    }

    async fn add_client_config(&self, config: &McpClientConfig) -> Result<(), McpError> {
        let cancel = CancellationToken::new();
        let (tool_map, connected) = match config.client.list_tools(cancel).await {
            Ok(result) => (
                result
                    .tools
                    .into_iter()
                    .map(|tool| (tool.name.to_string(), tool))
                    .collect(),
                true,
            ),
            Err(err) => {
                warn!("MCP client {} failed to list tools: {err}", config.name);
                (HashMap::new(), false)
            }
        };

        let mut clients = self.clients.write().await;
        if clients.contains_key(&config.name) {
            return Err(McpError::DuplicateClient(config.name.clone()));
        }
        clients.insert(
            config.name.clone(),
            ClientState {
                client: Arc::clone(&config.client),
                tools_to_execute: config.tools_to_execute.clone(),
                tools_to_skip: config.tools_to_skip.clone(),
                tool_map,
                connected,
            },
        );
        info!("MCP client {} registered", config.name);
        Ok(())
    }

    pub async fn add_client(&self, config: McpClientConfig) -> Result<(), McpError> {
        self.add_client_config(&config).await
    }

    pub async fn remove_client(&self, name: &str) -> Result<(), McpError> {
        let mut clients = self.clients.write().await;
        clients
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| McpError::UnknownClient(name.to_string()))
    }

    /// Adjusts a client's allow/deny filters.
    pub async fn edit_client_tools(
        &self,
        name: &str,
        tools_to_add: Vec<String>,
        tools_to_remove: Vec<String>,
    ) -> Result<(), McpError> {
        let mut clients = self.clients.write().await;
        let state = clients
            .get_mut(name)
            .ok_or_else(|| McpError::UnknownClient(name.to_string()))?;

        for tool in tools_to_add {
            state.tools_to_skip.retain(|t| t != &tool);
            if !state.tools_to_execute.contains(&tool) {
                state.tools_to_execute.push(tool);
            }
        }
        for tool in tools_to_remove {
            state.tools_to_execute.retain(|t| t != &tool);
            if !state.tools_to_skip.contains(&tool) {
                state.tools_to_skip.push(tool);
            }
        }
        Ok(())
    }

    /// Refreshes a client's tool list and marks it connected on success.
    pub async fn reconnect_client(&self, name: &str) -> Result<(), McpError> {
        let client = {
            let clients = self.clients.read().await;
            let state = clients
                .get(name)
                .ok_or_else(|| McpError::UnknownClient(name.to_string()))?;
            Arc::clone(&state.client)
        };

        let result = client.list_tools(CancellationToken::new()).await?;

        let mut clients = self.clients.write().await;
        if let Some(state) = clients.get_mut(name) {
            state.tool_map = result
                .tools
                .into_iter()
                .map(|tool| (tool.name.to_string(), tool))
                .collect();
            state.connected = true;
        }
        Ok(())
    }

    pub async fn get_clients(&self) -> Vec<McpClientInfo> {
        let clients = self.clients.read().await;
        let mut infos: Vec<McpClientInfo> = clients
            .iter()
            .map(|(name, state)| {
                let mut tools: Vec<String> = state.tool_map.keys().cloned().collect();
                tools.sort();
                McpClientInfo {
                    name: name.clone(),
                    tools,
                    state: if state.connected {
                        McpConnectionState::Connected
                    } else {
                        McpConnectionState::Disconnected
                    },
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Registers an in-process tool. Local tools shadow remote tools of the
    /// same name during execution.
    pub async fn register_tool(
        &self,
        name: &str,
        handler: ToolHandler,
        descriptor: Tool,
    ) -> Result<(), McpError> {
        let mut local = self.local_tools.write().await;
        local.insert(
            name.to_string(),
            LocalTool {
                handler,
                descriptor,
            },
        );
        Ok(())
    }

    /// Merges every visible tool descriptor into the request parameters.
    /// Idempotent: tools already present by name are left untouched, so
    /// re-submitted requests do not accumulate duplicates.
    pub async fn add_tools_to_request(&self, request: &mut Request) {
        let params = request.params.get_or_insert_with(ModelParams::default);
        let tools = params.tools.get_or_insert_with(Vec::new);
        let mut seen: std::collections::HashSet<String> =
            tools.iter().map(|t| t.function.name.clone()).collect();

        {
            let local = self.local_tools.read().await;
            for (name, tool) in local.iter() {
                if seen.insert(name.clone()) {
                    tools.push(tool.descriptor.clone());
                }
            }
        }

        let clients = self.clients.read().await;
        for state in clients.values() {
            if !state.connected {
                continue;
            }
            for (name, tool) in &state.tool_map {
                if state.visible(name) && seen.insert(name.clone()) {
                    tools.push(tool_from_mcp(tool));
                }
            }
        }
    }

    /// Executes a tool call and returns the tool message to feed back into
    /// the conversation.
    pub async fn execute_tool(
        &self,
        cancel: CancellationToken,
        call: &ToolCall,
    ) -> Result<ChatMessage, McpError> {
        let name = call
            .function
            .name
            .as_deref()
            .ok_or(McpError::MissingToolName)?;
        let arguments: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);

        let local_handler = {
            let local = self.local_tools.read().await;
            local.get(name).map(|tool| Arc::clone(&tool.handler))
        };
        if let Some(handler) = local_handler {
            debug!(tool = name, "executing registered tool");
            let output = handler(arguments).await.map_err(McpError::Handler)?;
            return Ok(ChatMessage::tool_result(call.id.clone(), output));
        }

        let client = {
            let clients = self.clients.read().await;
            clients
                .values()
                .find(|state| state.connected && state.tool_map.contains_key(name) && state.visible(name))
                .map(|state| Arc::clone(&state.client))
                .ok_or_else(|| McpError::UnknownTool(name.to_string()))?
        };

        let arguments = match arguments {
            Value::Object(map) => Some(map),
            _ => None,
        };
        debug!(tool = name, "executing MCP tool");
        let result = client.call_tool(name, arguments, cancel).await?;

        let text = result
            .content
            .iter()
            .filter_map(|content| content.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error.unwrap_or(false) {
            return Err(McpError::ToolReportedError(name.to_string(), text));
        }

        Ok(ChatMessage::tool_result(call.id.clone(), text))
    }

    /// Drops every client and registered tool. Connection teardown is the
    /// owner's concern.
    pub async fn cleanup(&self) {
        self.clients.write().await.clear();
        self.local_tools.write().await.clear();
    }
}

fn tool_from_mcp(tool: &McpTool) -> Tool {
    Tool::function(
        tool.name.to_string(),
        tool.description.as_deref().unwrap_or("").to_string(),
        Value::Object((*tool.input_schema).clone()),
    )
}
