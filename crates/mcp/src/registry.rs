// Capability registry: the declarative table of resources, tools, and prompts

use crate::protocol::{
    CallToolResult, CreateMessageParams, CreateMessageResult, GetPromptResult, PromptSchema,
    ResourceContents, ResourceSchema, ResourceTemplateSchema, ToolSchema,
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors from a sampling round-trip to the connected agent
#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    /// The session's outbound stream is gone.
    #[error("Sampling connection closed")]
    ConnectionClosed,

    /// No reply arrived within the configured wait.
    #[error("Sampling request timed out")]
    Timeout,

    /// The agent answered with a JSON-RPC error.
    #[error("Sampling request failed: {0}")]
    ErrorReply(String),

    /// The reply did not decode as a create-message result.
    #[error("Malformed sampling reply: {0}")]
    MalformedReply(String),
}

/// Issues nested generation requests to the connected agent
///
/// Implemented by the per-session protocol connection; tools that need the
/// agent to synthesize content go through this seam.
#[async_trait::async_trait]
pub trait Sampler: Send + Sync {
    async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult, SamplingError>;
}

/// A tool failure carrying its user-facing text
///
/// Nothing escapes a tool handler as a fault; dispatch converts this into a
/// normal success-shaped result whose content is the failure text.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ToolError(pub String);

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A read-only, URI-addressed data capability
#[async_trait::async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Static URI schema, for resources addressed by a fixed URI
    fn schema(&self) -> Option<ResourceSchema> {
        None
    }

    /// Template schema, for resources addressed through a URI template
    fn template_schema(&self) -> Option<ResourceTemplateSchema> {
        None
    }

    /// Read the resource; `params` holds the template bindings (empty for
    /// static resources)
    async fn read(&self, uri: &str, params: &HashMap<String, String>)
        -> Result<ResourceContents>;
}

/// A named, schema-typed callable capability that may have side effects
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Run the tool; `Ok` carries the success text, `Err` the failure text
    async fn call(
        &self,
        arguments: serde_json::Value,
        sampler: &dyn Sampler,
    ) -> Result<String, ToolError>;
}

/// A named template producing a message for the agent, no side effects
pub trait PromptHandler: Send + Sync {
    fn schema(&self) -> PromptSchema;

    fn get(&self, arguments: &HashMap<String, String>) -> Result<GetPromptResult>;
}

/// Registry of every capability this server exposes
#[derive(Default)]
pub struct CapabilityRegistry {
    resources: Vec<Arc<dyn ResourceHandler>>,
    tools: Vec<Arc<dyn ToolHandler>>,
    prompts: Vec<Arc<dyn PromptHandler>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_resource(&mut self, resource: Arc<dyn ResourceHandler>) {
        self.resources.push(resource);
    }

    pub fn register_tool(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.push(tool);
    }

    pub fn register_prompt(&mut self, prompt: Arc<dyn PromptHandler>) {
        self.prompts.push(prompt);
    }

    pub fn list_resources(&self) -> Vec<ResourceSchema> {
        self.resources.iter().filter_map(|r| r.schema()).collect()
    }

    pub fn list_resource_templates(&self) -> Vec<ResourceTemplateSchema> {
        self.resources
            .iter()
            .filter_map(|r| r.template_schema())
            .collect()
    }

    pub fn list_tools(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    pub fn list_prompts(&self) -> Vec<PromptSchema> {
        self.prompts.iter().map(|p| p.schema()).collect()
    }

    /// Resolve a URI to a handler, binding any template parameters
    pub fn resolve_resource(
        &self,
        uri: &str,
    ) -> Option<(Arc<dyn ResourceHandler>, HashMap<String, String>)> {
        for resource in &self.resources {
            if let Some(schema) = resource.schema() {
                if schema.uri == uri {
                    return Some((resource.clone(), HashMap::new()));
                }
            }
            if let Some(template) = resource.template_schema() {
                if let Some(params) = match_uri_template(&template.uri_template, uri) {
                    return Some((resource.clone(), params));
                }
            }
        }
        None
    }

    pub fn find_prompt(&self, name: &str) -> Option<Arc<dyn PromptHandler>> {
        self.prompts.iter().find(|p| p.schema().name == name).cloned()
    }

    /// Call a tool by name, folding any failure into the success-shaped
    /// result the protocol expects
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        sampler: &dyn Sampler,
    ) -> Option<CallToolResult> {
        let tool = self.tools.iter().find(|t| t.schema().name == name)?;

        let result = match tool.call(arguments, sampler).await {
            Ok(text) => CallToolResult::text(text),
            Err(err) => {
                tracing::warn!("Tool '{}' failed: {}", name, err);
                CallToolResult::text(err.to_string())
            }
        };
        Some(result)
    }
}

/// Match a URI against a `{param}` template, binding parameter values
///
/// Parameters match a non-empty run of characters up to the next literal;
/// a binding never spans a `/`.
pub fn match_uri_template(template: &str, uri: &str) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut rest = uri;
    let mut tpl = template;

    while !tpl.is_empty() {
        match tpl.find('{') {
            Some(open) => {
                let (literal, after) = tpl.split_at(open);
                rest = rest.strip_prefix(literal)?;

                let close = after.find('}')?;
                let name = &after[1..close];
                tpl = &after[close + 1..];

                let value_end = match tpl.chars().next() {
                    Some(next) => rest.find(next)?,
                    None => rest.len(),
                };
                let value = &rest[..value_end];
                if value.is_empty() || value.contains('/') {
                    return None;
                }
                params.insert(name.to_string(), value.to_string());
                rest = &rest[value_end..];
            }
            None => {
                rest = rest.strip_prefix(tpl)?;
                tpl = "";
            }
        }
    }

    rest.is_empty().then_some(params)
}
