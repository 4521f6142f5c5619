/// Core workflow type definitions
///
/// Defines the in-memory graph model built from an n8n-style exported document:
/// named nodes carrying a type string and a parameter bag, plus a "main" connection
/// map from source node name to its ordered target node names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A workflow graph ready for execution
///
/// Built once per run from the stored JSON document and never mutated afterwards.
/// `connections` keeps the document order of the source map; both the order resolver
/// and the input resolver iterate it in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    /// Human-readable workflow name ("Unnamed" when the document has none)
    pub name: String,
    /// Nodes in declaration order
    pub nodes: Vec<Node>,
    /// Main-channel connections in document order
    pub connections: Vec<Connection>,
}

/// A single node of the workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node name, unique within the graph
    pub name: String,
    /// Raw type identifier (e.g., "n8n-nodes-base.httpRequest")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node-specific configuration parameters as flexible JSON
    pub parameters: Value,
}

/// Outgoing main-channel edges of one source node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Source node name
    pub source: String,
    /// Target node names in output order
    pub targets: Vec<String>,
}

/// Handler category of a node, derived from its type string
///
/// The classification is a priority-ordered, case-sensitive substring match. The first
/// matching row wins, so e.g. "HttpRequestSet" is an HTTP request node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Outgoing HTTP call
    /// Expected params: { "url": "https://...", "method": "POST", "headers": {...}, "body": {...} }
    HttpRequest,
    /// Webhook trigger; its output is the triggering payload
    Webhook,
    /// Data-set transform
    /// Expected params: { "values": { "key": "value" } }
    Set,
    /// Conditional branch stub
    If,
    /// Simulated Slack message
    /// Expected params: { "channel": "#ops", "text": "..." }
    Slack,
    /// Simulated Gmail send
    /// Expected params: { "toEmail": "a@b.c", "subject": "...", "text": "..." }
    Gmail,
    /// Any type without a built-in handler
    Unknown(String),
}

impl NodeKind {
    pub fn classify(node_type: &str) -> Self {
        let has = |needle: &str| node_type.contains(needle);

        if has("httpRequest") || has("HttpRequest") {
            NodeKind::HttpRequest
        } else if has("webhook") {
            NodeKind::Webhook
        } else if has("set") || has("Set") {
            NodeKind::Set
        } else if has("if") || has("If") {
            NodeKind::If
        } else if has("slack") {
            NodeKind::Slack
        } else if has("gmail") || has("Gmail") {
            NodeKind::Gmail
        } else {
            NodeKind::Unknown(node_type.to_string())
        }
    }
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        NodeKind::classify(&self.node_type)
    }

    /// Trigger-like nodes seed the execution order traversal
    pub fn is_entry_point(&self) -> bool {
        self.node_type.contains("trigger") || self.node_type.contains("webhook")
    }

    /// String parameter lookup trying several keys in order
    pub fn param_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|key| self.parameters.get(*key).and_then(Value::as_str))
    }

    /// Raw parameter lookup trying several keys in order, skipping nulls
    pub fn param(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .find_map(|key| self.parameters.get(*key).filter(|v| !v.is_null()))
    }
}

impl WorkflowGraph {
    /// Parse a workflow document from its JSON text
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(&value)
    }

    /// Build the graph from an n8n-style document
    ///
    /// Tolerates missing `name`, `nodes` and `connections`, extra fields such as
    /// `description` or `tags`, and both the flat `main: [{node}]` and the nested
    /// per-output `main: [[{node}]]` connection shapes.
    pub fn from_value(document: &Value) -> anyhow::Result<Self> {
        let root = document.as_object()
            .ok_or_else(|| anyhow::anyhow!("Workflow document must be a JSON object"))?;

        let name = root.get("name")
            .and_then(Value::as_str)
            .unwrap_or("Unnamed")
            .to_string();

        let mut nodes = Vec::new();
        if let Some(raw_nodes) = root.get("nodes").and_then(Value::as_array) {
            for (position, raw) in raw_nodes.iter().enumerate() {
                let node_name = raw.get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("Node at position {} has no name", position))?;
                let node_type = raw.get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let parameters = match raw.get("parameters") {
                    Some(Value::Object(params)) => Value::Object(params.clone()),
                    _ => Value::Object(Map::new()),
                };

                nodes.push(Node {
                    name: node_name.to_string(),
                    node_type: node_type.to_string(),
                    parameters,
                });
            }
        }

        let connections = match root.get("connections") {
            Some(Value::Object(map)) => parse_connections(map),
            _ => Vec::new(),
        };

        Ok(Self { name, nodes, connections })
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Sources whose main channel targets `name`, in connection-map order
    ///
    /// A source appears once per connection entry, even if it lists the same
    /// target several times.
    pub fn sources_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.connections.iter()
            .filter(move |conn| conn.targets.iter().any(|target| target == name))
            .map(|conn| conn.source.as_str())
    }
}

fn parse_connections(map: &Map<String, Value>) -> Vec<Connection> {
    map.iter()
        .map(|(source, channels)| {
            let mut targets = Vec::new();
            if let Some(main) = channels.get("main").and_then(Value::as_array) {
                for entry in main {
                    match entry {
                        // n8n nests one list per output index
                        Value::Array(per_output) => {
                            targets.extend(per_output.iter().filter_map(target_name));
                        }
                        other => targets.extend(target_name(other)),
                    }
                }
            }
            Connection { source: source.clone(), targets }
        })
        .collect()
}

fn target_name(entry: &Value) -> Option<String> {
    entry.get("node").and_then(Value::as_str).map(str::to_string)
}
