//! Agent and user WebSocket connections. Each socket gets a reader loop
//! and a writer task that drains the connection's hub queue and pings.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::protocol::{
    AgentCommand, AgentMessage, PairingCodeData, ScreenshotFrame, UserEvent, UserRequest,
};
use relay_core::{short_token, Error};
use relay_hub::UserHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::api::session_user;
use super::AppState;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const AGENT_MAX_MESSAGE: usize = 10 * 1024 * 1024;
const USER_MAX_MESSAGE: usize = 64 * 1024;

/// Next text frame, or `None` once the peer is gone or has been silent for
/// `idle`. Control frames count as activity.
async fn next_text(receiver: &mut SplitStream<WebSocket>, idle: Duration) -> Option<String> {
    loop {
        match tokio::time::timeout(idle, receiver.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => return Some(text),
            Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => return None,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "WebSocket receive error");
                return None;
            }
            Err(_) => {
                debug!(idle_secs = idle.as_secs(), "WebSocket idle timeout");
                return None;
            }
        }
    }
}

/// Drain `outbound` into the socket and ping periodically. A closed queue
/// (connection replaced or unregistered) closes the socket.
async fn write_pump(mut sender: SplitSink<WebSocket, WsMessage>, mut outbound: mpsc::Receiver<String>) {
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(text) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sender.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sender.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

pub async fn handle_agent_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(AGENT_MAX_MESSAGE)
        .on_upgrade(move |socket| agent_connection(socket, state))
}

async fn agent_connection(socket: WebSocket, state: AppState) {
    let (sender, mut receiver) = socket.split();

    let Some(first) = next_text(&mut receiver, AUTH_TIMEOUT).await else {
        info!("Agent closed or timed out before authenticating");
        return;
    };
    let token = match AgentMessage::parse(&first) {
        Ok(AgentMessage::Auth { data }) if !data.token.is_empty() => data.token,
        _ => {
            warn!("Agent's first message was not a valid auth");
            return;
        }
    };

    let session = state.hub.register_agent(&token);
    let conn_id = session.conn_id;
    let send_task = tokio::spawn(write_pump(sender, session.outbound));

    while let Some(text) = next_text(&mut receiver, IDLE_TIMEOUT).await {
        handle_agent_message(&state, &token, &text);
    }

    if state.hub.unregister_agent_conn(&token, conn_id) {
        state.hub.clear_agent_cache(&token);
    }
    send_task.abort();
}

fn handle_agent_message(state: &AppState, token: &str, text: &str) {
    let message = match AgentMessage::parse(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(agent = %short_token(token), error = %e, "Ignoring unrecognized agent message");
            return;
        }
    };

    match message {
        AgentMessage::RequestPairingCode => {
            let ttl = state.hub.config().pairing_code_ttl_secs;
            match state.store.create_pairing_code(token, Duration::from_secs(ttl)) {
                Ok(code) => {
                    info!(agent = %short_token(token), "Pairing code issued");
                    let reply = AgentCommand::PairingCode {
                        data: PairingCodeData { code, expires_in: ttl },
                    };
                    state.hub.send_command(token, &reply);
                }
                Err(e) => error!(agent = %short_token(token), error = %e, "Failed to create pairing code"),
            }
        }
        AgentMessage::Screenshot(frame) => {
            if frame.image.is_empty() {
                warn!(agent = %short_token(token), "Screenshot without image data");
            } else {
                state.hub.update_cache(token, &frame.image);
                debug!(agent = %short_token(token), size = frame.image.len(), "Screenshot cached");
            }
            state.hub.broadcast_to_agent_users(token, text);
        }
        AgentMessage::DomUpdate(_) => {
            state.hub.broadcast_to_agent_users(token, text);
        }
        AgentMessage::PageState { state: page } => {
            state.hub.update_page_state(token, page);
            debug!(agent = %short_token(token), "Page state cached");
        }
        AgentMessage::Auth { .. } => {
            debug!(agent = %short_token(token), "Ignoring repeated auth");
        }
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub async fn handle_user_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let Some(user_id) = session_user(&state, &headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    ws.max_message_size(USER_MAX_MESSAGE)
        .on_upgrade(move |socket| user_connection(socket, state, user_id))
}

async fn user_connection(socket: WebSocket, state: AppState, user_id: i64) {
    let (sender, mut receiver) = socket.split();
    let session = state.hub.register_user(user_id);
    let handle = session.handle;
    let send_task = tokio::spawn(write_pump(sender, session.outbound));

    while let Some(text) = next_text(&mut receiver, IDLE_TIMEOUT).await {
        handle_user_message(&state, &handle, &text);
    }

    state.hub.unregister_user(&handle);
    send_task.abort();
}

fn reply(handle: &UserHandle, event: &UserEvent) {
    match event.encode() {
        Ok(msg) => {
            handle.send(msg);
        }
        Err(e) => warn!(error = %e, "Failed to encode user event"),
    }
}

fn handle_user_message(state: &AppState, handle: &UserHandle, text: &str) {
    let user_id = handle.user_id;
    let request = match UserRequest::parse(text) {
        Ok(r) => r,
        Err(Error::Validation(msg)) => {
            reply(handle, &UserEvent::Error { error: msg });
            return;
        }
        Err(e) => {
            debug!(user_id, error = %e, "Ignoring malformed user message");
            return;
        }
    };

    match request {
        UserRequest::ConnectAgent { agent_token } => connect_agent(state, handle, &agent_token),
        UserRequest::Forward { kind } => {
            let Some(token) = state.hub.get_viewing(user_id) else {
                debug!(user_id, kind = %kind, "No agent selected");
                return;
            };
            debug!(user_id, agent = %short_token(&token), kind = %kind, "Forwarding command");
            if !state.hub.send_to_agent(&token, text.to_string()) {
                warn!(user_id, agent = %short_token(&token), kind = %kind, "Failed to forward command");
            }
        }
        UserRequest::Chat { message } => {
            let runtime = state.runtime.clone();
            tokio::spawn(async move {
                let outcome = runtime.handle_message(user_id, &message).await;
                debug!(user_id, ?outcome, "Chat turn finished");
            });
        }
        UserRequest::ClearConversation => {
            let runtime = state.runtime.clone();
            tokio::spawn(async move {
                runtime.clear_conversation(user_id).await;
            });
        }
        UserRequest::Unknown { kind } => {
            debug!(user_id, kind = %kind, "Ignoring unknown user message type");
        }
    }
}

/// Switch the user's view to `agent_token` after an ownership check, report
/// its status and replay the last screenshot so the view is not blank.
fn connect_agent(state: &AppState, handle: &UserHandle, agent_token: &str) {
    let user_id = handle.user_id;
    let owned = match state.store.get_agent_by_token(agent_token) {
        Ok(Some(agent)) => agent.user_id == user_id,
        Ok(None) => false,
        Err(e) => {
            error!(user_id, error = %e, "Agent lookup failed");
            false
        }
    };
    if !owned {
        reply(handle, &UserEvent::Error { error: "Agent not found".to_string() });
        return;
    }

    state.hub.set_viewing(user_id, agent_token);
    let online = state.hub.is_agent_online(agent_token);
    info!(user_id, agent = %short_token(agent_token), online, "User viewing agent");
    reply(handle, &UserEvent::AgentStatus { online });

    if let Some((image, _)) = state.hub.get_cached(agent_token) {
        let frame = AgentMessage::Screenshot(ScreenshotFrame {
            url: String::new(),
            image,
            width: 0,
            height: 0,
        });
        match frame.encode() {
            Ok(msg) => {
                handle.send(msg);
            }
            Err(e) => warn!(error = %e, "Failed to encode cached screenshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{spawn_server, test_state};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn recv_json(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send_json(client: &mut Client, value: Value) {
        client.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn connect_agent_socket(addr: std::net::SocketAddr, token: &str) -> Client {
        let (mut client, _) = connect_async(format!("ws://{}/ws/agent", addr)).await.unwrap();
        send_json(&mut client, json!({"type": "auth", "data": {"token": token}})).await;
        client
    }

    async fn connect_user_socket(addr: std::net::SocketAddr, session: &str) -> Client {
        let mut request = format!("ws://{}/ws/user", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Cookie", format!("session={}", session).parse().unwrap());
        let (client, _) = connect_async(request).await.unwrap();
        client
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_agent_pairing_code_and_screenshot_cache() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let addr = spawn_server(state.clone()).await;

        let mut agent = connect_agent_socket(addr, "agent_0123456789").await;
        send_json(&mut agent, json!({"type": "request_pairing_code"})).await;
        let reply = recv_json(&mut agent).await;
        assert_eq!(reply["type"], "pairing_code");
        assert_eq!(reply["data"]["expires_in"], 300);
        let code = reply["data"]["code"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 6);
        assert_eq!(
            state.store.validate_pairing_code(&code).unwrap().as_deref(),
            Some("agent_0123456789")
        );

        send_json(
            &mut agent,
            json!({"type": "screenshot", "url": "https://a", "image": "AAA", "width": 1920, "height": 1080}),
        )
        .await;
        let hub = state.hub.clone();
        wait_until(|| hub.get_cached("agent_0123456789").is_some()).await;
        assert_eq!(state.hub.get_cached("agent_0123456789").unwrap().0, "AAA");

        drop(agent);
        wait_until(|| !hub.is_agent_online("agent_0123456789")).await;
        assert!(state.hub.get_cached("agent_0123456789").is_none());
    }

    #[tokio::test]
    async fn test_user_socket_requires_session() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_server(test_state(&dir)).await;
        assert!(connect_async(format!("ws://{}/ws/user", addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_viewing_user_sees_agent_frames_and_can_forward() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let user = state.store.create_user("alice", "secret").unwrap();
        let session = state.store.create_session(user, Duration::from_secs(60)).unwrap();
        state.store.pair_agent(user, "agent_laptop", "Laptop").unwrap();
        let addr = spawn_server(state.clone()).await;

        let mut agent = connect_agent_socket(addr, "agent_laptop").await;
        let hub = state.hub.clone();
        wait_until(|| hub.is_agent_online("agent_laptop")).await;

        let mut phone = connect_user_socket(addr, &session).await;
        send_json(&mut phone, json!({"type": "connect_agent", "data": {"agent_token": "agent_laptop"}})).await;
        assert_eq!(recv_json(&mut phone).await, json!({"type": "agent_status", "online": true}));

        send_json(&mut agent, json!({"type": "dom_update", "url": "https://a", "title": "A", "html": "<p>x</p>"})).await;
        let update = recv_json(&mut phone).await;
        assert_eq!(update["type"], "dom_update");
        assert_eq!(update["html"], "<p>x</p>");

        send_json(&mut phone, json!({"type": "click_xy", "x": 10, "y": 20})).await;
        assert_eq!(recv_json(&mut agent).await, json!({"type": "click_xy", "x": 10, "y": 20}));
    }

    #[tokio::test]
    async fn test_connect_to_foreign_agent_is_refused() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let alice = state.store.create_user("alice", "a").unwrap();
        let bob = state.store.create_user("bob", "b").unwrap();
        state.store.pair_agent(bob, "agent_bob", "Bob PC").unwrap();
        let session = state.store.create_session(alice, Duration::from_secs(60)).unwrap();
        let addr = spawn_server(state.clone()).await;

        let mut phone = connect_user_socket(addr, &session).await;
        send_json(&mut phone, json!({"type": "connect_agent", "data": {"agent_token": "agent_bob"}})).await;
        assert_eq!(recv_json(&mut phone).await, json!({"type": "error", "error": "Agent not found"}));
        assert!(state.hub.get_viewing(alice).is_none());

        send_json(&mut phone, json!({"type": "chat_message"})).await;
        assert_eq!(
            recv_json(&mut phone).await,
            json!({"type": "error", "error": "Invalid chat message format"})
        );
    }

    #[tokio::test]
    async fn test_chat_without_selected_agent() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let user = state.store.create_user("alice", "secret").unwrap();
        let session = state.store.create_session(user, Duration::from_secs(60)).unwrap();
        let addr = spawn_server(state).await;

        let mut phone = connect_user_socket(addr, &session).await;
        send_json(&mut phone, json!({"type": "chat_message", "data": {"message": "hi"}})).await;
        let reply = recv_json(&mut phone).await;
        assert_eq!(reply["type"], "chat_response");
        assert_eq!(reply["content"], "請先選擇一個 Agent");
        assert_eq!(reply["is_error"], true);
    }
}
