pub mod routes;

use crate::auth::TokenVerifier;
use crate::cli::Args;
use crate::orchestrator::Orchestrator;
use crate::store::ConversationStore;
use axum::extract::DefaultBodyLimit;
use axum::routing::{ get, post, put, delete };
use axum::Router;
use log::{ error, info };
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{ Any, CorsLayer };

// Matches the transport-level upload bound: 10 files of 50 MB.
const MAX_BODY_BYTES: usize = 10 * 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn ConversationStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    /// When true a request without a valid bearer token is rejected;
    /// otherwise the exchange runs anonymously.
    pub require_auth: bool,
    pub upload_dir: String,
}

pub struct Server {
    addr: String,
    state: AppState,
    args: Args,
}

impl Server {
    pub fn new(addr: String, state: AppState, args: Args) -> Self {
        Self { addr, state, args }
    }

    pub fn router(state: AppState) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/api/chat", post(routes::chat_handler))
            .route("/api/chat/history/{session_id}", get(routes::history_handler))
            .route("/api/chat/sessions", get(routes::list_sessions_handler))
            .route("/api/chat/sessions/{session_id}", put(routes::rename_session_handler))
            .route("/api/chat/sessions/{session_id}", delete(routes::delete_session_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(cors)
            .with_state(state)
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let addr = self.addr.parse::<SocketAddr>()?;
        let app = Self::router(self.state.clone());

        if
            let (true, Some(cert_path), Some(key_path)) = (
                self.args.enable_tls,
                self.args.tls_cert_path.as_ref(),
                self.args.tls_key_path.as_ref(),
            )
        {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;

            info!("HTTPS server listening on: https://{}", addr);
            axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
        } else {
            info!("HTTP server listening on: http://{}", addr);
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    axum::serve(listener, app.into_make_service()).await?;
                }
                Err(e) => {
                    error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                    return Err(Box::new(e));
                }
            }
        }

        Ok(())
    }
}
