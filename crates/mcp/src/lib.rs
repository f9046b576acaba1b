// MCP (Model Context Protocol) server implementation
// Exposes the user directory as resources, tools, and prompts to agent clients

pub mod connection;
pub mod protocol;
pub mod registry;
pub mod users;

pub use connection::McpConnection;
pub use registry::{CapabilityRegistry, Sampler, SamplingError};
