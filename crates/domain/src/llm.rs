//! The `callLLM` contract.
//!
//! The daemon core never links a provider SDK; it depends only on this
//! trait. The binary wires in a concrete client, tests wire in stubs.

use crate::error::Result;
use crate::stream::{BoxStream, StreamEvent};
use crate::tool::{Message, ToolDefinition};

/// One streaming chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
}

/// A streaming LLM backend.
///
/// Implementations must emit [`StreamEvent::Done`] as the final item of a
/// successful stream; errors may surface either as `Err` items or by
/// failing the initial call.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}
