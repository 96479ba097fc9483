use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::protocol::AgentCommand;
use relay_core::short_token;
use relay_storage::DEFAULT_AGENT_NAME;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

use super::AppState;

pub const SESSION_COOKIE: &str = "session";

/// Value of cookie `name` from the request's `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
}

/// User behind the request's session cookie, if it is still valid.
pub fn session_user(state: &AppState, headers: &HeaderMap) -> Option<i64> {
    let token = cookie_value(headers, SESSION_COOKIE)?;
    match state.store.validate_session(token) {
        Ok(user) => user,
        Err(e) => {
            error!(error = %e, "Session lookup failed");
            None
        }
    }
}

fn session_cookie(state: &AppState, token: &str, max_age_secs: i64) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        SESSION_COOKIE, token, max_age_secs
    );
    if state.config.server.secure_cookies {
        cookie.push_str("; Secure");
    }
    cookie
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

#[derive(Debug, Serialize)]
pub struct ApiResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResult {
    fn ok() -> Json<Self> {
        Json(Self { success: true, message: None })
    }

    fn fail(message: &str) -> Json<Self> {
        Json(Self {
            success: false,
            message: Some(message.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

pub async fn handle_login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = payload else {
        return ApiResult::fail("Invalid request").into_response();
    };

    let user_id = match state.store.validate_user(&req.username, &req.password) {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!(username = %req.username, "Login rejected");
            return ApiResult::fail("Invalid username or password").into_response();
        }
        Err(e) => {
            error!(error = %e, "Login lookup failed");
            return ApiResult::fail("Invalid username or password").into_response();
        }
    };

    let ttl = Duration::from_secs(state.config.auth.session_ttl_days * 24 * 60 * 60);
    let token = match state.store.create_session(user_id, ttl) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, user_id, "Failed to create session");
            return ApiResult::fail("Failed to create session").into_response();
        }
    };

    info!(user_id, "User logged in");
    let cookie = session_cookie(&state, &token, ttl.as_secs() as i64);
    ([(header::SET_COOKIE, cookie)], ApiResult::ok()).into_response()
}

pub async fn handle_logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = cookie_value(&headers, SESSION_COOKIE) {
        if let Err(e) = state.store.delete_session(token) {
            warn!(error = %e, "Failed to delete session");
        }
    }
    let cookie = session_cookie(&state, "", -1);
    ([(header::SET_COOKIE, cookie)], ApiResult::ok()).into_response()
}

pub async fn handle_check_auth(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let authenticated = session_user(&state, &headers).is_some();
    Json(json!({ "authenticated": authenticated })).into_response()
}

// ---------------------------------------------------------------------------
// Pairing and agents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PairRequest {
    code: String,
    #[serde(default)]
    name: Option<String>,
}

pub async fn handle_pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PairRequest>, JsonRejection>,
) -> Response {
    let Some(user_id) = session_user(&state, &headers) else {
        return unauthorized();
    };
    let Ok(Json(req)) = payload else {
        return ApiResult::fail("Invalid request").into_response();
    };

    let agent_token = match state.store.validate_pairing_code(req.code.trim()) {
        Ok(Some(token)) => token,
        Ok(None) => return ApiResult::fail("Invalid or expired pairing code").into_response(),
        Err(e) => {
            error!(error = %e, "Pairing code lookup failed");
            return ApiResult::fail("Invalid or expired pairing code").into_response();
        }
    };

    let name = req
        .name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(DEFAULT_AGENT_NAME);
    if let Err(e) = state.store.pair_agent(user_id, &agent_token, name) {
        error!(error = %e, user_id, "Failed to pair agent");
        return ApiResult::fail("Failed to pair agent").into_response();
    }
    if let Err(e) = state.store.delete_pairing_code(req.code.trim()) {
        warn!(error = %e, "Failed to delete used pairing code");
    }

    state.hub.update_agent_owner(&agent_token, user_id);
    if !state.hub.send_command(&agent_token, &AgentCommand::Paired { user_id }) {
        warn!(agent = %short_token(&agent_token), "Paired agent is not connected");
    }

    ApiResult::ok().into_response()
}

#[derive(Debug, Serialize)]
pub struct AgentInfo {
    pub id: i64,
    pub token: String,
    pub name: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

pub async fn handle_agents_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(user_id) = session_user(&state, &headers) else {
        return unauthorized();
    };

    let agents = match state.store.list_user_agents(user_id) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, user_id, "Failed to list agents");
            vec![]
        }
    };

    let infos: Vec<AgentInfo> = agents
        .into_iter()
        .map(|a| AgentInfo {
            online: state.hub.is_agent_online(&a.token),
            last_seen: a
                .last_seen
                .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string()),
            id: a.id,
            token: a.token,
            name: a.name,
        })
        .collect();

    Json(infos).into_response()
}

#[derive(Deserialize)]
pub struct DeleteAgentRequest {
    id: i64,
}

pub async fn handle_agents_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<DeleteAgentRequest>, JsonRejection>,
) -> Response {
    let Some(user_id) = session_user(&state, &headers) else {
        return unauthorized();
    };
    let Ok(Json(req)) = payload else {
        return Json(json!({ "success": false })).into_response();
    };

    let success = match state.store.delete_agent(user_id, req.id) {
        Ok(deleted) => deleted,
        Err(e) => {
            error!(error = %e, user_id, id = req.id, "Failed to delete agent");
            false
        }
    };
    Json(json!({ "success": success })).into_response()
}
