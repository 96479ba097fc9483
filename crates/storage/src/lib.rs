pub mod store;

pub use store::{AgentDirectory, AgentRecord, Store, DEFAULT_AGENT_NAME};
