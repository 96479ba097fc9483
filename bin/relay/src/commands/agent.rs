//! `relay agent`: the desktop side. Launches Chrome, connects to the
//! server, pairs once, then executes relayed browser commands.

use futures::{SinkExt, StreamExt};
use rand::Rng;
use relay_browser::{execute_command, BrowserDriver, CdpBrowser, DomWatcher, Followup};
use relay_core::config::AgentClientConfig;
use relay_core::protocol::{AgentCommand, AgentMessage, AuthData, PairingCodeData};
use relay_core::{short_token, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::load_config;

/// `agent_` followed by 32 hex characters.
pub fn generate_agent_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    format!("agent_{}", hex::encode(bytes))
}

fn print_pairing_code(data: &PairingCodeData) {
    println!("╔═══════════════════════════════════════════╗");
    println!("║               配對碼                      ║");
    println!("╠═══════════════════════════════════════════╣");
    println!("║                                           ║");
    println!("║                 {}                    ║", data.code);
    println!("║                                           ║");
    println!("║   請在手機上輸入此配對碼 ({} 分鐘內有效)   ║", data.expires_in / 60);
    println!("╚═══════════════════════════════════════════╝");
    println!();
}

/// Write the agent section back without touching the rest of the file.
fn persist_agent_config(config_file: &Path, agent: &AgentClientConfig) -> anyhow::Result<()> {
    let mut on_disk = if config_file.exists() {
        Config::load(config_file)?
    } else {
        Config::default()
    };
    on_disk.agent = agent.clone();
    on_disk.save(config_file)?;
    Ok(())
}

/// One agent identity talking to one server, reconnecting as needed.
pub struct AgentClient {
    settings: AgentClientConfig,
    config_file: PathBuf,
    browser: Arc<dyn BrowserDriver>,
}

impl AgentClient {
    pub fn new(settings: AgentClientConfig, config_file: PathBuf, browser: Arc<dyn BrowserDriver>) -> Self {
        Self {
            settings,
            config_file,
            browser,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.settings.paired
    }

    pub async fn run_forever(&mut self) {
        let retry = Duration::from_secs(self.settings.reconnect_secs.max(1));
        loop {
            match self.run_session().await {
                Ok(()) => {
                    println!("連線中斷，重新連線...");
                }
                Err(e) => {
                    warn!(error = %e, "Connection failed");
                    println!("{} 秒後重試...", retry.as_secs());
                }
            }
            tokio::time::sleep(retry).await;
        }
    }

    /// One connection, from dial to disconnect.
    pub async fn run_session(&mut self) -> anyhow::Result<()> {
        let (ws, _) = connect_async(self.settings.server_url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(msg)).await {
                    debug!(error = %e, "Agent socket write failed");
                    break;
                }
            }
        });

        let auth = AgentMessage::Auth {
            data: AuthData {
                token: self.settings.agent_token.clone(),
            },
        };
        out_tx.send(auth.encode()?).await?;
        info!(agent = %short_token(&self.settings.agent_token), url = %self.settings.server_url, "Connected to server");
        println!("已連接到伺服器");

        if self.settings.paired {
            println!("狀態：已配對 ✓");
            println!();
            println!("等待手機連線...");
        } else {
            out_tx.send(AgentMessage::RequestPairingCode.encode()?).await?;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let (dom_tx, mut dom_rx) = mpsc::channel(8);
        let watcher = DomWatcher::new(self.browser.clone(), dom_tx)
            .with_interval(Duration::from_secs(self.settings.dom_poll_secs.max(1)));
        let watcher_handle = tokio::spawn(watcher.run_loop(shutdown_rx));
        let dom_out = out_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(snapshot) = dom_rx.recv().await {
                match AgentMessage::DomUpdate(snapshot).encode() {
                    Ok(msg) => {
                        if dom_out.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode DOM update"),
                }
            }
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_text(&text, &out_tx).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Agent socket read failed");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(());
        forwarder.abort();
        writer.abort();
        let _ = watcher_handle.await;
        Ok(())
    }

    async fn handle_text(&mut self, text: &str, out: &mpsc::Sender<String>) {
        let command = match AgentCommand::parse(text) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "Ignoring unrecognized server message");
                return;
            }
        };

        match &command {
            AgentCommand::PairingCode { data } => print_pairing_code(data),
            AgentCommand::Paired { user_id } => {
                self.settings.paired = true;
                if let Err(e) = persist_agent_config(&self.config_file, &self.settings) {
                    warn!(error = %e, "Failed to save paired state");
                }
                info!(user_id, "Agent paired");
                println!("✓ 配對成功！");
                println!();
            }
            _ => match execute_command(self.browser.as_ref(), &command).await {
                Followup::Screenshot => self.send_screenshot(out).await,
                Followup::PageState => self.send_page_state(out).await,
                Followup::Nothing => {}
            },
        }
    }

    async fn send_screenshot(&self, out: &mpsc::Sender<String>) {
        let frame = match self.browser.screenshot().await {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "Screenshot failed");
                return;
            }
        };
        match AgentMessage::Screenshot(frame).encode() {
            Ok(msg) => {
                let _ = out.send(msg).await;
            }
            Err(e) => warn!(error = %e, "Failed to encode screenshot"),
        }
    }

    async fn send_page_state(&self, out: &mpsc::Sender<String>) {
        let state = match self.browser.page_state().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Page state failed");
                return;
            }
        };
        match (AgentMessage::PageState { state }).encode() {
            Ok(msg) => {
                let _ = out.send(msg).await;
            }
            Err(e) => warn!(error = %e, "Failed to encode page state"),
        }
    }
}

pub async fn run(config_path: Option<PathBuf>, server: Option<String>, headed: bool) -> anyhow::Result<()> {
    let (paths, config, config_file) = load_config(config_path)?;
    let mut settings = config.agent;
    if let Some(url) = server {
        settings.server_url = url;
    }
    if headed {
        settings.headed = true;
    }
    if settings.agent_token.is_empty() {
        settings.agent_token = generate_agent_token();
        settings.paired = false;
        persist_agent_config(&config_file, &settings)?;
        info!(agent = %short_token(&settings.agent_token), "Generated agent token");
    }

    paths.ensure_dirs()?;
    let profile_dir = paths.browser_profiles_dir().join("default");
    println!("正在啟動瀏覽器...");
    let browser = Arc::new(CdpBrowser::launch(&profile_dir, settings.headed).await?);
    println!("瀏覽器已啟動");
    println!();

    let mut client = AgentClient::new(settings, config_file, browser.clone());
    tokio::select! {
        _ = client.run_forever() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\n正在關閉...");
        }
    }

    browser.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::protocol::{DomSnapshot, ScreenshotFrame, ScrollDirection};
    use relay_core::{Error, Result};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct FakeBrowser {
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrowserDriver for FakeBrowser {
        async fn navigate(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn click_selector(&self, _selector: &str) -> Result<()> {
            Ok(())
        }
        async fn click_xy(&self, _x: i64, _y: i64) -> Result<()> {
            Ok(())
        }
        async fn input(&self, _selector: Option<&str>, _value: &str) -> Result<()> {
            Ok(())
        }
        async fn press_key(&self, key: &str) -> Result<()> {
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }
        async fn scroll(&self, _direction: ScrollDirection, _amount: u32) -> Result<()> {
            Ok(())
        }
        async fn select_all(&self) -> Result<()> {
            Ok(())
        }
        async fn page_state(&self) -> Result<Value> {
            Ok(json!({"url": "https://example.com", "inputs": []}))
        }
        async fn screenshot(&self) -> Result<ScreenshotFrame> {
            Ok(ScreenshotFrame {
                url: "https://example.com".to_string(),
                image: "data:image/jpeg;base64,AAA".to_string(),
                width: 1920,
                height: 1080,
            })
        }
        async fn dom_snapshot(&self) -> Result<DomSnapshot> {
            Err(Error::Browser("no page".to_string()))
        }
    }

    async fn next_json(ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Value {
        loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_agent_token_shape() {
        let token = generate_agent_token();
        assert!(token.starts_with("agent_"));
        assert_eq!(token.len(), 6 + 32);
        assert!(token[6..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_agent_token());
    }

    #[tokio::test]
    async fn test_session_pairs_and_answers_commands() {
        let dir = TempDir::new().unwrap();
        let config_file = dir.path().join("config.json");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let auth = next_json(&mut ws).await;
            let pairing = next_json(&mut ws).await;
            assert_eq!(auth["data"]["token"], "agent_test");
            assert_eq!(pairing["type"], "request_pairing_code");

            let send = |v: Value| Message::Text(v.to_string());
            ws.send(send(json!({"type": "paired", "user_id": 7}))).await.unwrap();
            ws.send(send(json!({"type": "key", "key": "Enter"}))).await.unwrap();
            ws.send(send(json!({"type": "get_page_state"}))).await.unwrap();

            let replies = vec![next_json(&mut ws).await, next_json(&mut ws).await];
            ws.close(None).await.unwrap();
            replies
        });

        let settings = AgentClientConfig {
            server_url: format!("ws://{}", addr),
            agent_token: "agent_test".to_string(),
            ..Default::default()
        };
        let browser = Arc::new(FakeBrowser::default());
        let mut client = AgentClient::new(settings, config_file.clone(), browser.clone());
        client.run_session().await.unwrap();

        let replies = server.await.unwrap();
        assert_eq!(replies[0]["type"], "screenshot");
        assert_eq!(replies[0]["image"], "data:image/jpeg;base64,AAA");
        assert_eq!(replies[1]["type"], "page_state");
        assert_eq!(replies[1]["state"]["url"], "https://example.com");

        assert_eq!(*browser.keys.lock().unwrap(), vec!["Enter".to_string()]);
        assert!(client.is_paired());
        assert!(Config::load(&config_file).unwrap().agent.paired);
    }
}
