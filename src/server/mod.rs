//! HTTP API over the matcher and its document store.

pub mod routes;

use crate::matcher::Matcher;
use crate::source::FaceStore;
use std::sync::Arc;
use tracing::info;

/// Shared application state handed to every request handler.
pub struct AppState {
    pub matcher: Arc<Matcher>,
    /// Document store the matcher rebuilds from; writes land here first.
    pub faces: Arc<dyn FaceStore>,
}

impl AppState {
    pub fn new(matcher: Arc<Matcher>, faces: Arc<dyn FaceStore>) -> Self {
        Self { matcher, faces }
    }
}

/// Serve the API on `addr` until the process is stopped.
pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let app = routes::create_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
