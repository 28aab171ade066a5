//! The HTTP surface: WebSocket upgrade, health probe, UI configuration.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::UserSource;
use crate::client::{self, ClientInfo, OUTBOX_CAPACITY};
use crate::config::Config;
use crate::hub::{ClientEvent, ClientMessage, HubHandle, HubMessage};
use crate::names;

const REAL_IP_HEADER: &str = "x-real-ip";

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub users: Arc<dyn UserSource>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/config", get(ui_config))
        .route("/stream", get(stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> &'static str {
    concat!("glint signaling server ", env!("CARGO_PKG_VERSION"), "\n")
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rooms: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.hub.room_count().await {
        Ok(rooms) => (
            StatusCode::OK,
            Json(Health {
                status: "ok",
                rooms: Some(rooms),
                reason: None,
            }),
        ),
        Err(err) => {
            warn!(%err, "health probe failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Health {
                    status: "down",
                    rooms: None,
                    reason: Some(err.to_string()),
                }),
            )
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UiConfig {
    version: &'static str,
    /// A suggested name for the next room.
    room_name: String,
    close_room_when_owner_leaves: bool,
}

async fn ui_config(State(state): State<AppState>) -> Json<UiConfig> {
    Json(UiConfig {
        version: env!("CARGO_PKG_VERSION"),
        room_name: names::random_room_name(),
        close_room_when_owner_leaves: state.config.close_room_when_owner_leaves,
    })
}

async fn stream(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let addr = client_addr(&state.config, &headers, peer.ip());
    let user = state.users.current_user(&headers);
    ws.on_upgrade(move |socket| handle_socket(state, socket, addr, user))
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    addr: IpAddr,
    authenticated_user: Option<String>,
) {
    let (write, outbox) = mpsc::channel(OUTBOX_CAPACITY);
    let info = ClientInfo {
        id: Uuid::new_v4(),
        addr,
        authenticated_user,
        write,
    };
    let hub = state.hub.sender();
    // the id is not known to the hub yet, so this one bypasses the check
    let connected = HubMessage::Client(ClientMessage {
        info: info.clone(),
        skip_connected_check: true,
        event: ClientEvent::Connected,
    });
    if hub.send(connected).await.is_err() {
        return;
    }
    client::run(socket, info, outbox, hub).await;
}

/// The client address used for credential binding and the deny list.
///
/// Behind a reverse proxy the socket peer is the proxy; `X-Real-IP` is
/// honored only when the deployment says the proxy can be trusted.
fn client_addr(config: &Config, headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    if !config.trust_proxy_headers {
        return peer;
    }
    match headers
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        Some(real) => real,
        None => {
            debug!(%peer, "proxy headers trusted but X-Real-IP missing or invalid");
            peer
        }
    }
}
