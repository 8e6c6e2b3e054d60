//! Read-only HTTP view of a mapper.

use super::service::{Mapper, MapperStatus};
use crate::cluster::AgentRecord;

use anyhow::Result;
use axum::{Extension, Json, Router, http::StatusCode, routing::get};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

pub fn router(mapper: Arc<Mapper>) -> Router {
    Router::new()
        .route("/agents", get(handle_agents))
        .route("/status", get(handle_status))
        .layer(Extension(mapper))
}

pub async fn serve(mapper: Arc<Mapper>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Admin HTTP for mapper {} listening on {}", mapper.identity(), addr);
    axum::serve(listener, router(mapper)).await?;
    Ok(())
}

pub(crate) async fn handle_agents(
    Extension(mapper): Extension<Arc<Mapper>>,
) -> (StatusCode, Json<BTreeMap<String, AgentRecord>>) {
    (StatusCode::OK, Json(mapper.cluster().snapshot()))
}

pub(crate) async fn handle_status(
    Extension(mapper): Extension<Arc<Mapper>>,
) -> (StatusCode, Json<MapperStatus>) {
    (StatusCode::OK, Json(mapper.status()))
}
