//! In-memory stand-in for the Unity Connection `/vmrest` interfaces.
//!
//! Serves enough of CUPI, CUMI and CUTI to drive the client end to end:
//! wrapped user lists (JSON or XML), 404 diagnostic bodies, session cookies,
//! voice names, stream-file slots, multipart message uploads and a CUTI call
//! resource. Calls to `NO_ANSWER_NUMBER` never connect.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "JSESSIONIDSSO";
pub const SEED_USER_ID: &str = "5c7d4e38-1f2a-4b8e-9d61-0a7c3f9e2b14";
pub const NO_ANSWER_NUMBER: &str = "0000";

/// A message or broadcast upload as the server saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub user_id: String,
    pub part_types: Vec<String>,
    pub audio_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct CallRecord {
    pub number: String,
    pub connected: bool,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub users: Vec<Map<String, Value>>,
    pub voice_names: HashMap<String, Vec<u8>>,
    /// Stream files by name; `None` until content is uploaded.
    pub voice_files: HashMap<String, Option<Vec<u8>>>,
    pub messages: Vec<ReceivedMessage>,
    pub calls: HashMap<u32, CallRecord>,
    next_call: u32,
}

pub type Db = Arc<RwLock<MockState>>;

/// State holding one user, `jdoe`.
pub fn seeded() -> Db {
    let user = json!({
        "ObjectId": SEED_USER_ID,
        "Alias": "jdoe",
        "DisplayName": "Jane Doe",
        "FirstName": "Jane",
        "LastName": "Doe",
        "DtmfAccessId": "1001",
        "ListInDirectory": "true",
        "CreationTime": "2021-06-01T10:00:00Z",
    });
    let mut state = MockState::default();
    if let Value::Object(map) = user {
        state.users.push(map);
    }
    Arc::new(RwLock::new(state))
}

pub fn app() -> Router {
    app_with_state(seeded())
}

pub fn app_with_state(db: Db) -> Router {
    Router::new()
        .route("/vmrest/users", get(list_users).post(create_user))
        .route("/vmrest/users/{id}", get(get_user).put(update_user).delete(delete_user))
        .route("/vmrest/users/{id}/voicename", get(get_voice_name).put(put_voice_name))
        .route("/vmrest/voicefiles", post(allocate_voice_file))
        .route("/vmrest/voicefiles/{name}", put(put_voice_file))
        .route("/vmrest/messages", post(post_message))
        .route("/vmrest/broadcastmessages", post(post_message))
        .route("/vmrest/calls", post(place_call))
        .route("/vmrest/calls/{id}", get(call_status).post(call_control).delete(end_call))
        .layer(middleware::from_fn(session))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub async fn run_with_state(listener: TcpListener, db: Db) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(db)).await
}

/// Require Basic auth or a session cookie; issue a fresh cookie on
/// successful calls that did not present one.
async fn session(request: Request, next: Next) -> Response {
    let headers = request.headers();
    let has_auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "));
    let has_cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(&format!("{SESSION_COOKIE}=")));
    if !has_auth && !has_cookie {
        return error(StatusCode::UNAUTHORIZED, "authentication required");
    }

    let mut response = next.run(request).await;
    if response.status().is_success() && !has_cookie {
        let cookie = format!("{SESSION_COOKIE}={}; Path=/; Secure; HttpOnly", Uuid::new_v4().simple());
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

fn error(status: StatusCode, message: &str) -> Response {
    let code = status.canonical_reason().unwrap_or("ERROR").to_uppercase().replace(' ', "_");
    (status, Json(json!({"errors": {"code": code, "message": message}}))).into_response()
}

fn wants_xml(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("xml"))
}

fn object_path(resource: &str, id: impl std::fmt::Display) -> Response {
    (StatusCode::CREATED, format!("/vmrest/{resource}/{id}")).into_response()
}

#[derive(Deserialize)]
struct ListQuery {
    query: Option<String>,
}

/// `(alias is jdoe)` style filter on one column.
fn matches_query(user: &Map<String, Value>, query: &str) -> bool {
    let inner = query.trim().trim_start_matches('(').trim_end_matches(')');
    let mut words = inner.splitn(3, ' ');
    let (Some(column), Some("is"), Some(wanted)) = (words.next(), words.next(), words.next()) else {
        return true;
    };
    user.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(column))
        .and_then(|(_, v)| v.as_str())
        .is_some_and(|v| v.eq_ignore_ascii_case(wanted))
}

async fn list_users(
    State(db): State<Db>,
    Query(params): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    let state = db.read().await;
    let users: Vec<&Map<String, Value>> = state
        .users
        .iter()
        .filter(|u| params.query.as_deref().map_or(true, |q| matches_query(u, q)))
        .collect();

    if wants_xml(&headers) {
        let mut body = format!("<Users total=\"{}\">", users.len());
        for user in &users {
            body.push_str(&user_xml(user));
        }
        body.push_str("</Users>");
        return ([(header::CONTENT_TYPE, "application/xml")], body).into_response();
    }

    // A single match comes back as a bare object; none at all drops the
    // envelope entirely.
    let body = match users.as_slice() {
        [] => json!({"@total": "0"}),
        [one] => json!({"@total": "1", "User": one}),
        many => json!({"@total": many.len().to_string(), "User": many}),
    };
    Json(body).into_response()
}

fn user_xml(user: &Map<String, Value>) -> String {
    let mut out = String::from("<User>");
    for (key, value) in user {
        let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
        out.push_str(&format!("<{key}>{}</{key}>", escape_xml(&text)));
    }
    out.push_str("</User>");
    out
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

async fn create_user(State(db): State<Db>, Json(mut input): Json<Map<String, Value>>) -> Response {
    let alias = input.get("Alias").and_then(Value::as_str).unwrap_or_default().to_string();
    if alias.is_empty() {
        return error(StatusCode::BAD_REQUEST, "Alias is required");
    }
    let mut state = db.write().await;
    if state.users.iter().any(|u| u.get("Alias").and_then(Value::as_str) == Some(alias.as_str())) {
        return error(StatusCode::BAD_REQUEST, &format!("alias {alias} already exists"));
    }
    let id = Uuid::new_v4().to_string();
    input.insert("ObjectId".to_string(), Value::String(id.clone()));
    state.users.push(input);
    tracing::info!(%alias, %id, "user created");
    object_path("users", id)
}

async fn get_user(State(db): State<Db>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    let state = db.read().await;
    let Some(user) = state.users.iter().find(|u| u.get("ObjectId").and_then(Value::as_str) == Some(id.as_str())) else {
        return error(StatusCode::NOT_FOUND, &format!("no user with object id {id}"));
    };
    if wants_xml(&headers) {
        return ([(header::CONTENT_TYPE, "application/xml")], user_xml(user)).into_response();
    }
    Json(user.clone()).into_response()
}

async fn update_user(
    State(db): State<Db>,
    Path(id): Path<String>,
    Json(input): Json<Map<String, Value>>,
) -> Response {
    let mut state = db.write().await;
    let Some(user) = state.users.iter_mut().find(|u| u.get("ObjectId").and_then(Value::as_str) == Some(id.as_str())) else {
        return error(StatusCode::NOT_FOUND, &format!("no user with object id {id}"));
    };
    for (key, value) in input {
        if key != "ObjectId" {
            user.insert(key, value);
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_user(State(db): State<Db>, Path(id): Path<String>) -> Response {
    let mut state = db.write().await;
    let before = state.users.len();
    state.users.retain(|u| u.get("ObjectId").and_then(Value::as_str) != Some(id.as_str()));
    if state.users.len() == before {
        return error(StatusCode::NOT_FOUND, &format!("no user with object id {id}"));
    }
    state.voice_names.remove(&id);
    StatusCode::NO_CONTENT.into_response()
}

async fn get_voice_name(State(db): State<Db>, Path(id): Path<String>) -> Response {
    let state = db.read().await;
    match state.voice_names.get(&id) {
        Some(audio) => ([(header::CONTENT_TYPE, "audio/wav")], audio.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, &format!("user {id} has no voice name")),
    }
}

fn is_wav(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("audio/wav"))
}

async fn put_voice_name(
    State(db): State<Db>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_wav(&headers) || body.is_empty() {
        return error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "expected an audio/wav body");
    }
    let mut state = db.write().await;
    let known = state.users.iter().any(|u| u.get("ObjectId").and_then(Value::as_str) == Some(id.as_str()));
    if !known {
        return error(StatusCode::NOT_FOUND, &format!("no user with object id {id}"));
    }
    state.voice_names.insert(id, body.to_vec());
    StatusCode::NO_CONTENT.into_response()
}

async fn allocate_voice_file(State(db): State<Db>) -> Response {
    let name = format!("{}.wav", Uuid::new_v4().simple());
    db.write().await.voice_files.insert(name.clone(), None);
    (StatusCode::CREATED, name).into_response()
}

async fn put_voice_file(
    State(db): State<Db>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_wav(&headers) || body.is_empty() {
        return error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "expected an audio/wav body");
    }
    let mut state = db.write().await;
    match state.voice_files.get_mut(&name) {
        Some(slot) => {
            *slot = Some(body.to_vec());
            StatusCode::NO_CONTENT.into_response()
        }
        None => error(StatusCode::NOT_FOUND, &format!("no stream file slot named {name}")),
    }
}

#[derive(Deserialize)]
struct UserQuery {
    userobjectid: Option<String>,
}

struct Part<'a> {
    content_type: String,
    content: &'a [u8],
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split a multipart body into parts. `None` when the framing is broken.
fn multipart_parts<'a>(content_type: &str, body: &'a [u8]) -> Option<Vec<Part<'a>>> {
    let boundary = content_type.split("boundary=").nth(1)?.trim().trim_matches('"');
    let delimiter = format!("--{boundary}");
    let mut rest = body.strip_prefix(delimiter.as_bytes())?;
    let mut parts = Vec::new();
    loop {
        if rest.starts_with(b"--") {
            return Some(parts);
        }
        rest = rest.strip_prefix(b"\r\n")?;
        let header_end = find(rest, b"\r\n\r\n")?;
        let headers = std::str::from_utf8(&rest[..header_end]).ok()?;
        let content_type = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim().eq_ignore_ascii_case("content-type").then(|| value.trim().to_string())
            })
            .unwrap_or_default();
        let after_headers = &rest[header_end + 4..];
        let next = find(after_headers, format!("\r\n{delimiter}").as_bytes())?;
        parts.push(Part {
            content_type,
            content: &after_headers[..next],
        });
        rest = &after_headers[next + 2 + delimiter.len()..];
    }
}

async fn post_message(
    State(db): State<Db>,
    Query(params): Query<UserQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(user_id) = params.userobjectid.filter(|id| !id.is_empty()) else {
        return error(StatusCode::BAD_REQUEST, "userobjectid is required");
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("multipart/form-data") {
        return error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "expected multipart/form-data");
    }
    let Some(parts) = multipart_parts(content_type, &body) else {
        return error(StatusCode::BAD_REQUEST, "malformed multipart body");
    };
    if parts.len() < 2 {
        return error(StatusCode::BAD_REQUEST, "message needs metadata and content parts");
    }

    let audio_bytes = parts
        .iter()
        .filter(|p| p.content_type.starts_with("audio/"))
        .map(|p| p.content.len())
        .sum();
    let message = ReceivedMessage {
        user_id,
        part_types: parts.iter().map(|p| p.content_type.clone()).collect(),
        audio_bytes,
    };
    tracing::info!(parts = message.part_types.len(), audio_bytes, "message accepted");
    db.write().await.messages.push(message);
    StatusCode::ACCEPTED.into_response()
}

#[derive(Deserialize)]
struct PlaceCall {
    number: String,
    #[serde(rename = "maximumRings", default)]
    maximum_rings: Option<String>,
}

async fn place_call(State(db): State<Db>, Json(input): Json<PlaceCall>) -> Response {
    if input.number.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "number is required");
    }
    let mut state = db.write().await;
    state.next_call += 1;
    let id = state.next_call;
    let connected = input.number != NO_ANSWER_NUMBER;
    tracing::info!(id, number = %input.number, rings = ?input.maximum_rings, "placing call");
    state.calls.insert(
        id,
        CallRecord {
            number: input.number,
            connected,
        },
    );
    object_path("calls", id)
}

async fn call_status(State(db): State<Db>, Path(id): Path<u32>) -> Response {
    let state = db.read().await;
    match state.calls.get(&id) {
        Some(call) => Json(json!({"id": id.to_string(), "connected": call.connected.to_string()})).into_response(),
        None => error(StatusCode::NOT_FOUND, &format!("no call {id}")),
    }
}

async fn call_control(
    State(db): State<Db>,
    Path(id): Path<u32>,
    Json(input): Json<Map<String, Value>>,
) -> Response {
    let mut state = db.write().await;
    if !state.calls.get(&id).is_some_and(|c| c.connected) {
        return error(StatusCode::NOT_FOUND, &format!("call {id} is not connected"));
    }
    match input.get("op").and_then(Value::as_str) {
        Some("RECORD") => {
            let name = format!("{}.wav", Uuid::new_v4().simple());
            let mut audio = b"RIFF".to_vec();
            audio.resize(512, 0);
            state.voice_files.insert(name.clone(), Some(audio));
            Json(json!({"op": "RECORD", "resourceId": name, "lastResult": "0"})).into_response()
        }
        Some("PLAY") => {
            let resource = input.get("resourceId").and_then(Value::as_str).unwrap_or_default();
            if !matches!(state.voice_files.get(resource), Some(Some(_))) {
                return error(StatusCode::NOT_FOUND, &format!("no stream resource {resource}"));
            }
            Json(json!({"op": "PLAY", "lastResult": "0"})).into_response()
        }
        _ => error(StatusCode::BAD_REQUEST, "unsupported call control op"),
    }
}

async fn end_call(State(db): State<Db>, Path(id): Path<u32>) -> Response {
    match db.write().await.calls.remove(&id) {
        Some(call) => {
            tracing::info!(id, number = %call.number, "call ended");
            StatusCode::NO_CONTENT.into_response()
        }
        None => error(StatusCode::NOT_FOUND, &format!("no call {id}")),
    }
}
