//! In-process relay between desktop agents and phone users.
//!
//! [`Hub`] owns every live connection, the viewing assignments, the latest
//! screenshot and page state per agent, and the table of callers waiting for
//! a fresh snapshot. Connection handlers talk to it only through its methods.

pub mod cache;
pub mod heartbeat;
pub mod hub;
pub mod registry;

pub use cache::{PendingTable, SnapshotCache};
pub use heartbeat::HeartbeatService;
pub use hub::{AgentSession, Hub, UserSession};
pub use registry::{Registry, UserHandle};
