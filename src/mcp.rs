//! In-process tool servers.
//!
//! A [`ToolServer`] is a named collection of tools that run inside the
//! SDK process. The CLI reaches them through `mcp_message` control
//! requests carrying JSON-RPC envelopes; routing and protocol handling
//! live in the internal router.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::errors::ToolError;

// ============================================================================
// Content
// ============================================================================

/// One content item of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    /// Plain text.
    #[serde(rename = "text")]
    Text {
        /// The text.
        text: String,
    },
    /// An image.
    #[serde(rename = "image")]
    Image {
        /// Base64-encoded image bytes.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// A resource reference.
    #[serde(rename = "resource")]
    Resource {
        /// Resource URI.
        uri: String,
        /// MIME type, if known.
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// Inline text content, if available.
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl ToolContent {
    /// Create a text item.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image item.
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Create a resource item.
    pub fn resource(uri: impl Into<String>) -> Self {
        Self::Resource {
            uri: uri.into(),
            mime_type: None,
            text: None,
        }
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content items.
    pub content: Vec<ToolContent>,
    /// Whether the result represents a tool-level error.
    #[serde(rename = "is_error", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResult {
    /// A successful text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: None,
        }
    }

    /// A tool-level error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(message)],
            is_error: Some(true),
        }
    }

    /// A result with explicit content items.
    pub fn with_content(content: Vec<ToolContent>) -> Self {
        Self {
            content,
            is_error: None,
        }
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Schema of one tool input property. Array schemas reference an item
/// schema, so the type is recursive; the `Box` indirection inherits its
/// `Send`/`Sync` from the boxed schema rather than asserting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PropertySchema {
    /// A string property.
    String {
        /// Human-readable description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// A floating-point property.
    Number {
        /// Human-readable description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// An integer property.
    Integer {
        /// Human-readable description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// A boolean property.
    Boolean {
        /// Human-readable description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// An array property.
    Array {
        /// Human-readable description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// Schema of the array elements.
        items: Box<PropertySchema>,
    },
}

impl PropertySchema {
    /// A string schema with a description.
    pub fn string(description: impl Into<String>) -> Self {
        Self::String {
            description: Some(description.into()),
        }
    }

    /// A number schema with a description.
    pub fn number(description: impl Into<String>) -> Self {
        Self::Number {
            description: Some(description.into()),
        }
    }

    /// An array schema with a description and element schema.
    pub fn array(description: impl Into<String>, items: PropertySchema) -> Self {
        Self::Array {
            description: Some(description.into()),
            items: Box::new(items),
        }
    }
}

/// Input schema of a tool: a JSON-Schema object with typed properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInputSchema {
    /// Property schemas by name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, PropertySchema>,
    /// Names of required properties.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl ToolInputSchema {
    /// An empty object schema.
    pub fn object() -> Self {
        Self::default()
    }

    /// Add a string property.
    pub fn string_property(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.properties
            .insert(name.into(), PropertySchema::string(description));
        self
    }

    /// Add a number property.
    pub fn number_property(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.properties
            .insert(name.into(), PropertySchema::number(description));
        self
    }

    /// Add a boolean property.
    pub fn boolean_property(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.properties.insert(
            name.into(),
            PropertySchema::Boolean {
                description: Some(description.into()),
            },
        );
        self
    }

    /// Add an array property.
    pub fn array_property(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        items: PropertySchema,
    ) -> Self {
        self.properties
            .insert(name.into(), PropertySchema::array(description, items));
        self
    }

    /// Mark a property as required.
    pub fn required_property(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    /// Wire encoding: a JSON-Schema `object` with the property map.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required,
        })
    }
}

// ============================================================================
// Tools and servers
// ============================================================================

/// Future type returned by tool handlers.
pub type ToolHandlerFuture = Pin<Box<dyn Future<Output = Result<ToolResult, ToolError>> + Send>>;

/// Handler invoked for `tools/call`. Receives the call arguments as
/// dynamic JSON; an `Err` surfaces as a JSON-RPC error response.
pub type ToolHandler = Arc<dyn Fn(Value) -> ToolHandlerFuture + Send + Sync>;

/// One tool hosted by a [`ToolServer`].
pub struct SdkTool {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// Input schema.
    pub input_schema: ToolInputSchema,
    /// Handler.
    pub handler: ToolHandler,
}

impl SdkTool {
    /// Create a tool from a name, description, schema and handler.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: ToolInputSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(move |input| Box::pin(handler(input))),
        }
    }
}

impl std::fmt::Debug for SdkTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish()
    }
}

/// A named, versioned collection of in-process tools. Immutable after
/// construction.
#[derive(Clone)]
pub struct ToolServer {
    name: String,
    version: String,
    tools: Arc<HashMap<String, Arc<SdkTool>>>,
    order: Arc<Vec<String>>,
}

impl std::fmt::Debug for ToolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServer")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolServer {
    /// Create a server from its tools. Later tools shadow earlier ones
    /// with the same name.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        tools: Vec<SdkTool>,
    ) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for tool in tools {
            if !map.contains_key(&tool.name) {
                order.push(tool.name.clone());
            }
            map.insert(tool.name.clone(), Arc::new(tool));
        }
        Self {
            name: name.into(),
            version: version.into(),
            tools: Arc::new(map),
            order: Arc::new(order),
        }
    }

    /// Server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Look up a tool by name.
    pub fn tool(&self, name: &str) -> Option<Arc<SdkTool>> {
        self.tools.get(name).cloned()
    }

    /// Tools in registration order.
    pub fn tools(&self) -> Vec<Arc<SdkTool>> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name).cloned())
            .collect()
    }

    /// Descriptor announced to the CLI at initialize.
    pub fn descriptor(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "version": self.version,
        })
    }
}
