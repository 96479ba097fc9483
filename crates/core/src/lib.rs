pub mod config;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use paths::Paths;

/// First ten characters of an agent token, for log lines.
pub fn short_token(token: &str) -> &str {
    match token.char_indices().nth(10) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}
