use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use axum::{
    extract::{connect_info::Connected, ConnectInfo, Query, Request, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    serve::IncomingStream,
    Json, Router,
};
use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::sync::{Synchronizer, UpdateRequest};

pub struct AppState {
    pub synchronizer: Synchronizer,
    /// Cancelled when the server shuts down; parent of every request token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Default, PartialEq)]
struct UpdateQuery {
    name: Option<String>,
    ipv4: Option<String>,
    ipv6: Option<String>,
}

impl UpdateQuery {
    /// Repeated keys are joined with `,`, so a repeated address fails
    /// validation instead of rejecting the request.
    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut query = UpdateQuery::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "name" => &mut query.name,
                "ipv4" => &mut query.ipv4,
                "ipv6" => &mut query.ipv6,
                _ => continue,
            };
            match slot {
                Some(existing) => {
                    existing.push(',');
                    existing.push_str(&value);
                }
                None => *slot = Some(value),
            }
        }
        query
    }
}

/// Per-connection transport details attached to every request.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub id: String,
    pub remote_addr: SocketAddr,
}

impl Connected<IncomingStream<'_, TcpListener>> for ClientConnection {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self {
            id: next_connection_id(),
            remote_addr: *stream.remote_addr(),
        }
    }
}

const ID_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

static CONNECTION_COUNTER: LazyLock<AtomicU64> = LazyLock::new(|| {
    let seed = time::OffsetDateTime::now_utc().unix_timestamp_nanos() as u64;
    AtomicU64::new(seed)
});

fn next_connection_id() -> String {
    encode_connection_id(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// 13 base-32 characters, most significant first.
fn encode_connection_id(value: u64) -> String {
    (0..13)
        .rev()
        .map(|i| ID_ALPHABET[((value >> (i * 5)) & 0x1f) as usize] as char)
        .collect()
}

pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/", get(update_records))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

async fn access_log(request: Request, next: Next) -> Response {
    let start = Instant::now();

    // Extract request info
    let method = request.method().clone();
    let uri = request.uri();
    let path = match uri.query() {
        Some(q) => format!("{}?{}", uri.path(), q),
        None => uri.path().to_string(),
    };
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let (connection, ip) = request
        .extensions()
        .get::<ConnectInfo<ClientConnection>>()
        .map(|ConnectInfo(c)| (c.id.clone(), c.remote_addr.ip().to_canonical().to_string()))
        .unwrap_or_else(|| ("-".to_string(), "-".to_string()));

    // Process request
    let response = next.run(request).await;

    let status = response.status().as_u16();
    let duration = start.elapsed();

    // Access log format: method path "user-agent" ip connection status duration
    info!(
        target: "access",
        "{} {} \"{}\" {} {} {} {:.3}ms",
        method, path, user_agent, ip, connection, status, duration.as_secs_f64() * 1000.0
    );

    response
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "Healthy"
    }))
}

/// Synchronizes the supplied addresses and always answers 200; outcomes
/// are only visible in the logs.
async fn update_records(
    State(state): State<Arc<AppState>>,
    ConnectInfo(connection): ConnectInfo<ClientConnection>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> StatusCode {
    let query = UpdateQuery::from_pairs(pairs);
    let request = UpdateRequest {
        name: query.name.unwrap_or_default(),
        ipv4: query.ipv4,
        ipv6: query.ipv6,
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        connection_id: Some(connection.id),
        remote_ip: Some(connection.remote_addr.ip().to_canonical().to_string()),
    };

    // Dropping this handler (client went away) cancels the in-flight calls.
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();

    state.synchronizer.synchronize(&request, &cancel).await;

    StatusCode::OK
}
