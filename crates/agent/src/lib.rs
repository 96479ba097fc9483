//! Chat orchestration: conversation history, the hub-backed browser proxy
//! and the model ↔ tool loop.

pub mod conversation;
pub mod prompt;
pub mod proxy;
pub mod runtime;

pub use conversation::{validate_and_clean, Conversation, ConversationManager};
pub use proxy::HubBrowserControl;
pub use runtime::{ChatOutcome, ChatRuntime};
