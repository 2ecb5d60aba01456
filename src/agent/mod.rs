//! The agentic pipeline: model client, event protocol and the tool-calling loop.

pub mod events;
pub mod model;
pub mod openai;
pub mod runner;
pub mod streaming_content;

pub use events::{AgentEvent, EventSink};
pub use model::{history_to_chat_messages, ChatMessage, ChatModel, ModelDelta};
pub use openai::OpenAiChatService;
pub use runner::{AgentLoop, RoundRecord, Termination, TurnOutcome};
pub use streaming_content::extract_streaming_content;
