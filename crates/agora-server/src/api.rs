use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, Method, StatusCode},
    middleware,
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use agora_shared::constants::{DEFAULT_HISTORY_LIMIT, MAX_PAGE_SIZE};
use agora_shared::protocol::ServerFrame;
use agora_shared::token::TokenService;
use agora_shared::types::{RoomId, UserId};
use agora_store::{Database, MemberSummary, Message, NewRoom, Room, RoomUpdate, StoreError};

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::presence::PresenceRegistry;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::session::{Session, SessionContext};
use crate::store::Store;
use crate::transport::WsTransport;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub presence: PresenceRegistry,
    pub broadcaster: Broadcaster,
    pub tokens: Arc<TokenService>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database) -> Self {
        let store = Store::new(db);
        let presence = PresenceRegistry::new();
        let broadcaster = Broadcaster::new(store.clone(), presence.clone(), config.max_message_len);
        let tokens = Arc::new(TokenService::with_ttl(
            config.jwt_secret.as_bytes(),
            config.token_ttl,
        ));

        Self {
            store,
            presence,
            broadcaster,
            tokens,
            rate_limiter: RateLimiter::default(),
            config: Arc::new(config),
        }
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            store: self.store.clone(),
            presence: self.presence.clone(),
            broadcaster: self.broadcaster.clone(),
            tokens: self.tokens.clone(),
            history_limit: self.config.history_limit,
            outbound_buffer: self.config.outbound_buffer,
            idle_timeout: self.config.idle_timeout,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/rooms", post(create_room).get(list_rooms))
        .route("/rooms/{room_id}", get(get_room).patch(update_room))
        .route("/rooms/{room_id}/join", post(join_room))
        .route("/rooms/{room_id}/leave", post(leave_room))
        .route("/rooms/{room_id}/members", get(list_members))
        .route("/rooms/{room_id}/members/{user_id}", delete(expel_member))
        .route("/rooms/{room_id}/messages", get(recent_messages))
        .route("/ws/{room_id}/{user_id}", get(ws_connect))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// The caller, from a `Authorization: Bearer <token>` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub username: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ServerError::AuthInvalid)?;

        let claims = state.tokens.verify(token.trim())?;
        Ok(Self {
            user_id: claims.user_id()?,
            username: claims.username,
        })
    }
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online: usize,
}

/// A room as shown to one viewer. The invite code is only ever shown to
/// the room's manager.
#[derive(Debug, Serialize)]
struct RoomView {
    id: RoomId,
    name: String,
    is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    invite_code: Option<String>,
    manager_id: Option<UserId>,
    category_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl RoomView {
    fn new(room: Room, show_code: bool) -> Self {
        Self {
            id: room.id,
            name: room.name,
            is_private: room.is_private,
            invite_code: room.invite_code.filter(|_| show_code),
            manager_id: room.manager_id,
            category_id: room.category_id,
            created_at: room.created_at,
        }
    }

    fn for_viewer(room: Room, viewer: UserId) -> Self {
        let show_code = room.is_managed_by(viewer);
        Self::new(room, show_code)
    }

    fn listing(room: Room) -> Self {
        Self::new(room, false)
    }
}

#[derive(Deserialize)]
struct CreateRoomRequest {
    name: String,
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    category_id: Option<i64>,
}

#[derive(Deserialize)]
struct Pagination {
    #[serde(default)]
    skip: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_HISTORY_LIMIT
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

#[derive(Deserialize)]
struct JoinRequest {
    #[serde(default)]
    invite_code: Option<String>,
}

#[derive(Serialize)]
struct JoinResponse {
    room_id: RoomId,
    user_id: UserId,
    joined_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
}

fn check_limit(limit: u32) -> Result<u32, ServerError> {
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(ServerError::BadRequest(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    Ok(limit)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online: state.presence.online_count(),
    })
}

async fn create_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomView>), ServerError> {
    let new = NewRoom {
        manager_id: auth.user_id,
        name: req.name,
        is_private: req.is_private,
        category_id: req.category_id,
    };
    let room = state.store.call(move |db| db.create_room(&new)).await?;

    Ok((
        StatusCode::CREATED,
        Json(RoomView::for_viewer(room, auth.user_id)),
    ))
}

async fn list_rooms(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<RoomView>>, ServerError> {
    let limit = check_limit(page.limit)?;
    let skip = page.skip;
    let rooms = state.store.call(move |db| db.list_rooms(skip, limit)).await?;
    Ok(Json(rooms.into_iter().map(RoomView::listing).collect()))
}

async fn get_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<RoomId>,
) -> Result<Json<RoomView>, ServerError> {
    let room = state.store.call(move |db| db.get_room(room_id)).await?;
    Ok(Json(RoomView::for_viewer(room, auth.user_id)))
}

async fn update_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<RoomId>,
    Json(update): Json<RoomUpdate>,
) -> Result<Json<RoomView>, ServerError> {
    if update.is_empty() {
        return Err(ServerError::BadRequest("nothing to update".into()));
    }
    let manager = auth.user_id;
    let room = state
        .store
        .call(move |db| db.update_room(manager, room_id, &update))
        .await?;

    info!(room = %room_id, manager = %manager, "room updated");
    Ok(Json(RoomView::for_viewer(room, manager)))
}

async fn join_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<RoomId>,
    Json(req): Json<JoinRequest>,
) -> Result<(StatusCode, Json<JoinResponse>), ServerError> {
    let user_id = auth.user_id;
    let membership = state
        .store
        .call(move |db| db.join_room(user_id, room_id, req.invite_code.as_deref()))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(JoinResponse {
            room_id: membership.room_id,
            user_id: membership.user_id,
            joined_at: membership.joined_at,
        }),
    ))
}

async fn leave_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<RoomId>,
) -> Result<StatusCode, ServerError> {
    let user_id = auth.user_id;
    state
        .store
        .call(move |db| db.leave_room(user_id, room_id))
        .await?;

    announce(&state, room_id, ServerFrame::left(room_id, &auth.username)).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_members(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(room_id): Path<RoomId>,
) -> Result<Json<Vec<MemberSummary>>, ServerError> {
    let members = state.store.call(move |db| db.list_members(room_id)).await?;
    Ok(Json(members))
}

async fn expel_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((room_id, user_id)): Path<(RoomId, UserId)>,
) -> Result<StatusCode, ServerError> {
    let manager = auth.user_id;
    let expelled = state
        .store
        .call(move |db| {
            db.expel_member(manager, room_id, user_id)?;
            db.get_user(user_id)
        })
        .await?;

    announce(&state, room_id, ServerFrame::expelled(room_id, &expelled.username)).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn recent_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<RoomId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let limit = check_limit(query.limit)?;
    let user_id = auth.user_id;
    let messages = state
        .store
        .call(move |db| {
            db.get_room(room_id)?;
            if !db.is_member(user_id, room_id)? {
                return Err(StoreError::NotAMember);
            }
            db.recent_messages(room_id, limit)
        })
        .await?;
    Ok(Json(messages))
}

/// Upgrade to a websocket and hand the socket to a [`Session`].
///
/// The upgrade always succeeds; a bad token or a non-member is turned away
/// by the session with a policy-violation close.
async fn ws_connect(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(RoomId, UserId)>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let ctx = state.session_context();
    ws.on_upgrade(move |socket| async move {
        let session = Session::new(ctx, WsTransport::new(socket), room_id, user_id);
        let outcome = session.run(params.token.as_deref()).await;
        debug!(room = %room_id, user = %user_id, outcome = ?outcome, "session finished");
    })
}

async fn announce(state: &AppState, room_id: RoomId, frame: ServerFrame) {
    if let Err(e) = state.broadcaster.announce(room_id, frame).await {
        debug!(room = %room_id, error = %e, "announcement failed");
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    struct TestApp {
        _dir: tempfile::TempDir,
        state: AppState,
    }

    impl TestApp {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = Database::open_at(&dir.path().join("agora.db")).unwrap();
            let config = ServerConfig {
                jwt_secret: "api-test-secret".into(),
                ..ServerConfig::default()
            };
            Self {
                _dir: dir,
                state: AppState::new(config, db),
            }
        }

        /// Create a user and return (id, bearer token).
        async fn user(&self, name: &str) -> (UserId, String) {
            let owned = name.to_string();
            let user = self
                .state
                .store
                .call(move |db| db.create_user(&owned, "opaque-hash"))
                .await
                .unwrap();
            let token = self.state.tokens.issue(user.id, name).unwrap();
            (user.id, token)
        }

        async fn request(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            let req = match body {
                Some(body) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let resp = build_router(self.state.clone()).oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let app = TestApp::new();
        let (status, body) = app.request(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["online"], 0);
    }

    #[tokio::test]
    async fn test_missing_or_bad_token_is_unauthorized() {
        let app = TestApp::new();
        let (status, body) = app.request(Method::GET, "/rooms", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid or expired token");

        let (status, _) = app
            .request(Method::GET, "/rooms", Some("not-a-jwt"), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_private_room_code_visible_to_manager_only() {
        let app = TestApp::new();
        let (_alice, alice_token) = app.user("alice").await;
        let (bob, bob_token) = app.user("bob").await;

        let (status, room) = app
            .request(
                Method::POST,
                "/rooms",
                Some(&alice_token),
                Some(json!({ "name": "vault", "is_private": true })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let code = room["invite_code"].as_str().unwrap().to_string();
        let uri = format!("/rooms/{}", room["id"]);

        let (_, seen_by_bob) = app.request(Method::GET, &uri, Some(&bob_token), None).await;
        assert!(seen_by_bob.get("invite_code").is_none());

        let (_, listing) = app
            .request(Method::GET, "/rooms", Some(&alice_token), None)
            .await;
        assert!(listing[0].get("invite_code").is_none());

        let join_uri = format!("{uri}/join");
        let (status, body) = app
            .request(
                Method::POST,
                &join_uri,
                Some(&bob_token),
                Some(json!({ "invite_code": "NOPE" })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Invite code does not match");

        let (status, body) = app
            .request(
                Method::POST,
                &join_uri,
                Some(&bob_token),
                Some(json!({ "invite_code": code })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user_id"], bob.0);

        let (status, _) = app
            .request(
                Method::POST,
                &join_uri,
                Some(&bob_token),
                Some(json!({ "invite_code": code })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_history_is_members_only_and_capped() {
        let app = TestApp::new();
        let (alice, alice_token) = app.user("alice").await;
        let (_bob, bob_token) = app.user("bob").await;

        let (_, room) = app
            .request(
                Method::POST,
                "/rooms",
                Some(&alice_token),
                Some(json!({ "name": "lobby" })),
            )
            .await;
        let room_id = RoomId(room["id"].as_i64().unwrap());
        app.state
            .store
            .call(move |db| db.append_message(room_id, alice, "hello", 4096))
            .await
            .unwrap();

        let uri = format!("/rooms/{room_id}/messages");
        let (status, messages) = app.request(Method::GET, &uri, Some(&alice_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(messages[0]["content"], "hello");

        let (status, _) = app.request(Method::GET, &uri, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .request(Method::GET, &format!("{uri}?limit=500"), Some(&alice_token), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_expel_is_manager_only() {
        let app = TestApp::new();
        let (_alice, alice_token) = app.user("alice").await;
        let (bob, bob_token) = app.user("bob").await;

        let (_, room) = app
            .request(
                Method::POST,
                "/rooms",
                Some(&alice_token),
                Some(json!({ "name": "lobby" })),
            )
            .await;
        let uri = format!("/rooms/{}", room["id"]);
        app.request(Method::POST, &format!("{uri}/join"), Some(&bob_token), Some(json!({})))
            .await;

        let alice_id = room["manager_id"].as_i64().unwrap();
        let (status, _) = app
            .request(
                Method::DELETE,
                &format!("{uri}/members/{alice_id}"),
                Some(&bob_token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .request(
                Method::DELETE,
                &format!("{uri}/members/{bob}"),
                Some(&alice_token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, members) = app
            .request(Method::GET, &format!("{uri}/members"), Some(&alice_token), None)
            .await;
        assert_eq!(members.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_room_is_not_found() {
        let app = TestApp::new();
        let (_alice, token) = app.user("alice").await;
        let (status, body) = app.request(Method::GET, "/rooms/404", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "room not found");
    }
}
