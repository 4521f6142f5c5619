/// Node dispatch and built-in handlers
///
/// `NodeExecutor` maps every `NodeKind` variant to one handler. The mapping is an
/// exhaustive match, so adding a kind without a handler does not compile. Unknown
/// types get a fallback handler that never fails the run.
///
/// Built-in handlers:
/// - HttpRequest: real outbound call through reqwest, bounded by a timeout
/// - Webhook: passthrough of the triggering payload
/// - Set: copies `parameters.values` into a fresh object
/// - If: marks the input with `conditionMet: true` (no real branching)
/// - Slack / Gmail: simulated actions, no network traffic

use crate::runtime::context::{ExecutionContext, ExecutionLog};
use crate::runtime::engine::EngineError;
use crate::runtime::order::{resolve_input, NodeInput};
use crate::workflow::types::{Node, NodeKind, WorkflowGraph};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::{sync::Arc, time::Duration};

/// Computes a node's output from its resolved input
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, node: &Node, input: &NodeInput, log: &mut ExecutionLog) -> Result<Value>;
}

/// Registry of one handler per node kind
#[derive(Clone)]
pub struct NodeExecutor {
    http_request: Arc<dyn NodeHandler>,
    webhook: Arc<dyn NodeHandler>,
    set: Arc<dyn NodeHandler>,
    condition: Arc<dyn NodeHandler>,
    slack: Arc<dyn NodeHandler>,
    gmail: Arc<dyn NodeHandler>,
    unknown: Arc<dyn NodeHandler>,
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor").finish_non_exhaustive()
    }
}

impl NodeExecutor {
    /// Create the executor with the built-in handlers
    pub fn new(http_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http_request: Arc::new(HttpRequestHandler::new(http_timeout)?),
            webhook: Arc::new(WebhookHandler),
            set: Arc::new(SetHandler),
            condition: Arc::new(IfHandler),
            slack: Arc::new(SlackHandler),
            gmail: Arc::new(GmailHandler),
            unknown: Arc::new(UnknownTypeHandler),
        })
    }

    /// Replace the handler serving `kind` (any `Unknown` value targets the fallback)
    pub fn with_handler(mut self, kind: &NodeKind, handler: Arc<dyn NodeHandler>) -> Self {
        let slot = match kind {
            NodeKind::HttpRequest => &mut self.http_request,
            NodeKind::Webhook => &mut self.webhook,
            NodeKind::Set => &mut self.set,
            NodeKind::If => &mut self.condition,
            NodeKind::Slack => &mut self.slack,
            NodeKind::Gmail => &mut self.gmail,
            NodeKind::Unknown(_) => &mut self.unknown,
        };
        *slot = handler;
        self
    }

    pub fn handler_for(&self, kind: &NodeKind) -> &dyn NodeHandler {
        match kind {
            NodeKind::HttpRequest => self.http_request.as_ref(),
            NodeKind::Webhook => self.webhook.as_ref(),
            NodeKind::Set => self.set.as_ref(),
            NodeKind::If => self.condition.as_ref(),
            NodeKind::Slack => self.slack.as_ref(),
            NodeKind::Gmail => self.gmail.as_ref(),
            NodeKind::Unknown(_) => self.unknown.as_ref(),
        }
    }

    /// Execute one node and record its output in the context
    ///
    /// Counts the dispatch, resolves the node's input from already finished upstream
    /// nodes, runs the handler and stores the output. A handler error is wrapped with
    /// the node's name.
    pub async fn dispatch(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        run_input: &Value,
        context: &mut ExecutionContext,
    ) -> Result<Value, EngineError> {
        context.log.push(format!("📍 Executing node: {} ({})", node.name, node.node_type));
        context.node_execution_count += 1;

        let input = resolve_input(graph, &node.name, &context.node_outputs, run_input);
        let start_time = std::time::Instant::now();
        let kind = node.kind();

        match self.handler_for(&kind).execute(node, &input, &mut context.log).await {
            Ok(output) => {
                tracing::debug!("📤 Output of '{}': {}", node.name, output);
                context.record_output(&node.name, output.clone());
                context.log.push(format!("✅ Node completed: {} in {:?}", node.name, start_time.elapsed()));
                Ok(output)
            }
            Err(source) => {
                context.log.push(format!("❌ Node failed: {} - {:#}", node.name, source));
                Err(EngineError::NodeFailed { node: node.name.clone(), source })
            }
        }
    }
}

/// Outbound HTTP request handler
#[derive(Debug, Clone)]
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodeHandler for HttpRequestHandler {
    async fn execute(&self, node: &Node, _input: &NodeInput, log: &mut ExecutionLog) -> Result<Value> {
        let url = node.param_str(&["url", "requestUrl"]).unwrap_or("");
        let method = node.param_str(&["method", "requestMethod"])
            .unwrap_or("GET")
            .to_uppercase();

        log.push(format!("  HTTP {} {}", method, url));

        let method = match method.as_str() {
            "GET" | "POST" | "PUT" | "DELETE" | "PATCH" | "HEAD" | "OPTIONS" => {
                reqwest::Method::from_bytes(method.as_bytes())?
            }
            other => return Err(anyhow::anyhow!("Unsupported HTTP method: {}", other)),
        };

        let mut request_builder = self.client.request(method, url);

        if let Some(headers) = node.parameters.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                let header_value = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                request_builder = request_builder.header(key.as_str(), header_value);
            }
        }

        match node.param(&["body", "bodyParameters"]) {
            Some(Value::String(text)) => {
                request_builder = request_builder.body(text.clone());
            }
            Some(body) => {
                request_builder = request_builder.json(body);
            }
            None => {}
        }

        let response = request_builder.send().await.map_err(|e| {
            log.push(format!("  HTTP Error: {}", e));
            anyhow::anyhow!("HTTP request failed: {}", e)
        })?;

        let status = response.status();
        log.push(format!("  Response: {}", status));

        if status.is_client_error() || status.is_server_error() {
            return Err(anyhow::anyhow!("Request failed with status code {}", status.as_u16()));
        }

        let headers: Map<String, Value> = response.headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), Value::String(s.to_string()))))
            .collect();

        let text = response.text().await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(json!({
            "statusCode": status.as_u16(),
            "headers": headers,
            "body": body,
        }))
    }
}

/// Webhook trigger: its output is the triggering payload
#[derive(Debug, Clone, Copy)]
pub struct WebhookHandler;

#[async_trait]
impl NodeHandler for WebhookHandler {
    async fn execute(&self, _node: &Node, input: &NodeInput, log: &mut ExecutionLog) -> Result<Value> {
        log.push("  Webhook trigger - using input data");
        if input.primary.is_null() {
            Ok(json!({}))
        } else {
            Ok(input.primary.clone())
        }
    }
}

/// Data-set transform
#[derive(Debug, Clone, Copy)]
pub struct SetHandler;

#[async_trait]
impl NodeHandler for SetHandler {
    async fn execute(&self, node: &Node, _input: &NodeInput, log: &mut ExecutionLog) -> Result<Value> {
        let values = node.parameters.get("values")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        log.push(format!("  Setting {} values", values.len()));
        Ok(Value::Object(values))
    }
}

/// Conditional stub; every condition passes
#[derive(Debug, Clone, Copy)]
pub struct IfHandler;

#[async_trait]
impl NodeHandler for IfHandler {
    async fn execute(&self, _node: &Node, input: &NodeInput, log: &mut ExecutionLog) -> Result<Value> {
        log.push("  Evaluating conditions");

        let mut output = match &input.primary {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        output.insert("conditionMet".to_string(), Value::Bool(true));
        Ok(Value::Object(output))
    }
}

/// Simulated Slack message
#[derive(Debug, Clone, Copy)]
pub struct SlackHandler;

#[async_trait]
impl NodeHandler for SlackHandler {
    async fn execute(&self, node: &Node, _input: &NodeInput, log: &mut ExecutionLog) -> Result<Value> {
        let message = node.param_str(&["text", "message"]).unwrap_or("Hello from runloom!");
        let channel = node.param_str(&["channel"]).unwrap_or("#general");

        log.push(format!("  Would send Slack message to {}", channel));
        log.push(format!("  Message: {}", message));

        Ok(json!({
            "ok": true,
            "channel": channel,
            "message": message,
            "ts": Utc::now().timestamp_millis().to_string(),
            "simulated": true,
        }))
    }
}

/// Simulated Gmail send
#[derive(Debug, Clone, Copy)]
pub struct GmailHandler;

#[async_trait]
impl NodeHandler for GmailHandler {
    async fn execute(&self, node: &Node, _input: &NodeInput, log: &mut ExecutionLog) -> Result<Value> {
        let to = node.param_str(&["toEmail", "to"]).unwrap_or("");
        let subject = node.param_str(&["subject"]).unwrap_or("Email from runloom");

        log.push(format!("  Would send email to {}", to));
        log.push(format!("  Subject: {}", subject));

        Ok(json!({
            "messageId": format!("sim-{}", Utc::now().timestamp_millis()),
            "to": to,
            "subject": subject,
            "sent": true,
            "simulated": true,
        }))
    }
}

/// Fallback for node types without a handler
#[derive(Debug, Clone, Copy)]
pub struct UnknownTypeHandler;

#[async_trait]
impl NodeHandler for UnknownTypeHandler {
    async fn execute(&self, node: &Node, _input: &NodeInput, log: &mut ExecutionLog) -> Result<Value> {
        tracing::warn!("⚠️ Unknown node type: {}", node.node_type);
        log.push(format!("⚠️ Unknown node type: {}", node.node_type));

        Ok(json!({
            "message": format!("Node type {} not yet implemented", node.node_type),
            "nodeType": node.node_type,
        }))
    }
}
