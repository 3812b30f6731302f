use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{future, SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use parley_auth::{spawn_purge_task, AuthConfig, ChallengeBroker, Purgeable, SessionConfig, SessionStore};
use parley_core::ids::UserId;
use parley_core::provider::CompletionBackend;
use parley_llm::{BridgeConfig, CompletionBridge, Tokenizer};
use parley_store::{Database, SessionRepo, StoreError, UserRepo};

use crate::connection::{ConnectionConfig, ConnectionSession, TransportError};
use crate::extract::Authenticated;
use crate::login;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Upper bound on REST request handling. Chat sockets are exempt.
    pub request_timeout: Duration,
    /// Mark session cookies `Secure`.
    pub secure_cookies: bool,
    pub connection: ConnectionConfig,
    pub auth: AuthConfig,
    pub sessions: SessionConfig,
    pub bridge: BridgeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            secure_cookies: false,
            connection: ConnectionConfig::default(),
            auth: AuthConfig::default(),
            sessions: SessionConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
    #[error("failed to load sessions: {0}")]
    Store(#[from] StoreError),
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<CompletionBridge>,
    pub broker: Arc<ChallengeBroker>,
    pub sessions: Arc<SessionStore>,
    pub users: UserRepo,
    pub connection: ConnectionConfig,
    pub secure_cookies: bool,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route("/api/login/step1", post(login::step1))
        .route("/api/login/step2", post(login::step2))
        .route("/api/logout", post(login::logout))
        .route("/api/user/password", post(login::change_password))
        .route("/api/user/settings", post(login::update_settings))
        .route("/health", get(health_handler))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/api/ws/chat", get(ws_handler))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    db: Database,
    backend: Arc<dyn CompletionBackend>,
    tokenizer: Arc<dyn Tokenizer>,
) -> Result<ServerHandle, ServerError> {
    let sessions = Arc::new(SessionStore::load(SessionRepo::new(db.clone()), config.sessions.clone())?);
    let users = UserRepo::new(db);
    let broker = Arc::new(ChallengeBroker::new(
        users.clone(),
        Arc::clone(&sessions),
        config.auth.clone(),
    ));
    let bridge = Arc::new(CompletionBridge::with_config(backend, tokenizer, config.bridge.clone()));
    let shutdown = CancellationToken::new();

    let purge = spawn_purge_task(
        vec![
            Arc::clone(&sessions) as Arc<dyn Purgeable>,
            Arc::clone(&broker) as Arc<dyn Purgeable>,
        ],
        config.sessions.purge_interval,
        shutdown.child_token(),
    );

    let state = AppState {
        bridge,
        broker,
        sessions,
        users,
        connection: config.connection.clone(),
        secure_cookies: config.secure_cookies,
        shutdown: shutdown.clone(),
    };
    let router = build_router(state, config.request_timeout);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "parley server started");

    let graceful = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        purge,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    purge: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting requests, close open chat sockets, and stop the purge loop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.purge.await;
        let _ = self.server.await;
        tracing::info!("parley server stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    Authenticated(session): Authenticated,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_chat(socket, session.user_id, state))
}

/// Run one chat connection until it asks to close or the server shuts down.
async fn serve_chat(socket: WebSocket, user_id: UserId, state: AppState) {
    let (sink, stream) = socket.split();
    let outbound = sink
        .sink_map_err(|e| TransportError(e.to_string()))
        .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));
    let inbound = stream
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text.to_string()),
                _ => None,
            })
        });

    let default_key = match state.users.get(&user_id) {
        Ok(user) => user.default_api_key(),
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "could not load account key");
            None
        }
    };
    let session = ConnectionSession::new(
        Arc::clone(&state.bridge),
        state.connection.clone(),
        Some(&user_id),
        default_key,
    );
    session.start(Box::pin(inbound), Box::pin(outbound));

    tokio::select! {
        _ = session.closed() => {}
        _ = state.shutdown.cancelled() => {}
    }
    session.stop().await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.sessions.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
