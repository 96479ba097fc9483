//! Desktop-side browser control: launching Chrome, driving it over the
//! DevTools protocol and applying relayed commands.

pub mod cdp;
pub mod dispatch;
pub mod driver;
pub mod launch;
pub mod scripts;
pub mod watcher;

pub use cdp::CdpClient;
pub use dispatch::{execute_command, Followup};
pub use driver::{key_definition, BrowserDriver, CdpBrowser, KeyDefinition};
pub use launch::{ChromeProcess, VIEWPORT_HEIGHT, VIEWPORT_WIDTH};
pub use watcher::DomWatcher;
