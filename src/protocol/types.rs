//! MCP protocol data types.
//!
//! Wire shapes for tool discovery and invocation plus the initialize
//! exchange. Field names follow the protocol's camelCase convention.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Protocol revision sent during the initialize exchange.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// ─── Tool schema ────────────────────────────────────────────────────────────

/// Primitive kind of one schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// One node of a tool's parameter schema.
///
/// Nesting is a tree: `properties` describes an object's fields, `items` an
/// array's element shape. Depth is unbounded but practically shallow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolParameter {
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, ToolParameter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ToolParameter>>,
}

impl ToolParameter {
    /// A bare node of the given kind, for building schemas in code.
    pub fn of_kind(kind: ParameterKind) -> Self {
        Self {
            kind,
            description: None,
            required: None,
            default: None,
            allowed_values: None,
            properties: None,
            items: None,
        }
    }

    /// An object node with the given named fields.
    pub fn object(properties: impl IntoIterator<Item = (String, ToolParameter)>) -> Self {
        Self {
            properties: Some(properties.into_iter().collect()),
            ..Self::of_kind(ParameterKind::Object)
        }
    }
}

/// One named, schema-described operation a backend service offers.
///
/// Names are unique within one service but not globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "input_schema")]
    pub input_schema: ToolParameter,
}

// ─── Tool invocation ────────────────────────────────────────────────────────

/// A request to invoke one tool by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

impl CallToolRequest {
    pub fn new(name: &str, arguments: serde_json::Value) -> Self {
        let arguments = match arguments {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            name: name.to_string(),
            arguments,
        }
    }
}

/// One typed content block in a tool result. Text is the only kind the
/// gateway routes today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

/// Result of a tool invocation.
///
/// `is_error: true` is a protocol-level success carrying an application
/// failure; transport failures never reach this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// A plain text success result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// A text result flagged as an application-level error.
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: true,
        }
    }
}

/// Reply payload of the tool-listing method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

// ─── Initialize exchange ────────────────────────────────────────────────────

/// Identity the backend reports during initialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// One protocol feature area flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCapability {
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

/// Which protocol feature areas a backend supports. The gateway only relies
/// on `tools`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<FeatureCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<FeatureCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<FeatureCapability>,
}

impl ServerCapabilities {
    pub fn supports_tools(&self) -> bool {
        self.tools.is_some()
    }
}

/// Reply payload of the initialize method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default)]
    pub server_info: ServerInfo,
}

/// Parameters the gateway sends with its initialize request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: serde_json::Value,
    pub client_info: ServerInfo,
}

impl InitializeParams {
    pub fn for_gateway() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: ServerInfo {
                name: "mcphub".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
