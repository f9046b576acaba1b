// User directory capabilities: two resources, two tools, one prompt

use crate::protocol::{
    CreateMessageParams, GetPromptResult, MessageContent, PromptArgument, PromptMessage,
    PromptSchema, ResourceContents, ResourceSchema, ResourceTemplateSchema, ToolAnnotations,
    ToolSchema,
};
use crate::registry::{
    CapabilityRegistry, PromptHandler, ResourceHandler, Sampler, ToolError, ToolHandler,
};
use anyhow::Result;
use roster_core::{JsonUserStore, NewUser};
use std::collections::HashMap;
use std::sync::Arc;

const FAILED_TO_SAVE: &str = "Failed to save user";
const FAILED_TO_GENERATE: &str = "Failed to generate user data";

const GENERATE_USER_INSTRUCTION: &str = "Generate fake user data. The user should have a realistic name, email, address, and phone number. Return this data as a JSON object with no other text or formatter so it can be used with JSON.parse.";

/// Build the full capability table backed by the given store
pub fn user_capabilities(store: Arc<JsonUserStore>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register_resource(Arc::new(UsersResource {
        store: store.clone(),
    }));
    registry.register_resource(Arc::new(UserDetailsResource {
        store: store.clone(),
    }));
    registry.register_tool(Arc::new(CreateUserTool {
        store: store.clone(),
    }));
    registry.register_tool(Arc::new(CreateRandomUserTool { store }));
    registry.register_prompt(Arc::new(GenerateFakeUserPrompt));
    registry
}

/// `users://all` — the full user collection as one JSON document
pub struct UsersResource {
    store: Arc<JsonUserStore>,
}

#[async_trait::async_trait]
impl ResourceHandler for UsersResource {
    fn schema(&self) -> Option<ResourceSchema> {
        Some(ResourceSchema {
            uri: "users://all".to_string(),
            name: "users".to_string(),
            title: Some("Users".to_string()),
            description: "Get all users data from the database".to_string(),
            mime_type: "application/json".to_string(),
        })
    }

    async fn read(
        &self,
        uri: &str,
        _params: &HashMap<String, String>,
    ) -> Result<ResourceContents> {
        let users = self.store.read_all().await?;
        Ok(ResourceContents::json(uri, serde_json::to_string(&users)?))
    }
}

/// `users://{userId}/profile` — one user, or a soft not-found payload
pub struct UserDetailsResource {
    store: Arc<JsonUserStore>,
}

#[async_trait::async_trait]
impl ResourceHandler for UserDetailsResource {
    fn template_schema(&self) -> Option<ResourceTemplateSchema> {
        Some(ResourceTemplateSchema {
            uri_template: "users://{userId}/profile".to_string(),
            name: "user-details".to_string(),
            title: Some("User Details".to_string()),
            description: "Get a user's details from the database".to_string(),
            mime_type: "application/json".to_string(),
        })
    }

    async fn read(&self, uri: &str, params: &HashMap<String, String>) -> Result<ResourceContents> {
        // A non-numeric binding simply matches no stored id
        let user_id = params.get("userId").and_then(|raw| raw.parse::<u64>().ok());

        let users = self.store.read_all().await?;
        let user = user_id.and_then(|id| users.into_iter().find(|u| u.id == id));

        let text = match user {
            Some(user) => serde_json::to_string(&user)?,
            None => serde_json::json!({"error": "User not found"}).to_string(),
        };
        Ok(ResourceContents::json(uri, text))
    }
}

/// `create-user` — append a user with the given contact fields
pub struct CreateUserTool {
    store: Arc<JsonUserStore>,
}

#[async_trait::async_trait]
impl ToolHandler for CreateUserTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "create-user".to_string(),
            description: "Create a new user in the database".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "email": {"type": "string"},
                    "address": {"type": "string"},
                    "phone": {"type": "string"},
                },
                "required": ["name", "email", "address", "phone"],
            }),
            annotations: Some(ToolAnnotations {
                title: Some("Create User".to_string()),
                read_only_hint: Some(false),
                destructive_hint: Some(false),
                idempotent_hint: Some(false),
                open_world_hint: Some(true),
            }),
        }
    }

    async fn call(
        &self,
        arguments: serde_json::Value,
        _sampler: &dyn Sampler,
    ) -> Result<String, ToolError> {
        let new_user: NewUser = serde_json::from_value(arguments)
            .map_err(|_| ToolError::new(FAILED_TO_SAVE))?;

        let id = self
            .store
            .append(new_user)
            .await
            .map_err(|_| ToolError::new(FAILED_TO_SAVE))?;

        Ok(format!("User {} created successfully", id))
    }
}

/// `create-random-user` — ask the connected agent to synthesize the fields
pub struct CreateRandomUserTool {
    store: Arc<JsonUserStore>,
}

#[async_trait::async_trait]
impl ToolHandler for CreateRandomUserTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "create-random-user".to_string(),
            description: "Create a random user with fake data".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {},
            }),
            annotations: Some(ToolAnnotations {
                title: Some("Create Random User".to_string()),
                read_only_hint: Some(false),
                destructive_hint: Some(false),
                idempotent_hint: Some(false),
                open_world_hint: Some(true),
            }),
        }
    }

    async fn call(
        &self,
        _arguments: serde_json::Value,
        sampler: &dyn Sampler,
    ) -> Result<String, ToolError> {
        let reply = sampler
            .create_message(CreateMessageParams::user_text(
                GENERATE_USER_INSTRUCTION,
                1024,
            ))
            .await
            .map_err(|_| ToolError::new(FAILED_TO_GENERATE))?;

        let MessageContent::Text { text } = reply.content else {
            return Err(ToolError::new(FAILED_TO_GENERATE));
        };

        let new_user: NewUser = serde_json::from_str(strip_code_fence(&text))
            .map_err(|_| ToolError::new(FAILED_TO_GENERATE))?;

        let id = self
            .store
            .append(new_user)
            .await
            .map_err(|_| ToolError::new(FAILED_TO_GENERATE))?;

        Ok(format!("User {} created successfully", id))
    }
}

/// Strip the code-fence markup agents tend to wrap JSON replies in
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let text = text.strip_prefix("```json").unwrap_or(text);
    let text = text.strip_suffix("```").unwrap_or(text);
    text.trim()
}

/// `generate-fake-user` — pure prompt template, no side effects
pub struct GenerateFakeUserPrompt;

impl PromptHandler for GenerateFakeUserPrompt {
    fn schema(&self) -> PromptSchema {
        PromptSchema {
            name: "generate-fake-user".to_string(),
            description: "Generate a fake user based on a given name".to_string(),
            arguments: vec![PromptArgument {
                name: "name".to_string(),
                description: None,
                required: Some(true),
            }],
        }
    }

    fn get(&self, arguments: &HashMap<String, String>) -> Result<GetPromptResult> {
        let name = arguments
            .get("name")
            .ok_or_else(|| anyhow::anyhow!("Missing required argument: name"))?;

        Ok(GetPromptResult {
            description: None,
            messages: vec![PromptMessage::user(format!(
                "Generate a fake user with the name {}. The user should have a realistic email, address, and phone number.",
                name
            ))],
        })
    }
}
