//! HTTP/JSON surface over the receipt processing core.

pub mod error;
pub mod handlers;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use routes::{create_router, AppState};

use std::net::SocketAddr;

use tracing::info;

use crate::domain::{ExpenseOpsError, Result};

/// Bind and serve the API until the process exits
pub async fn serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .map_err(|e| ExpenseOpsError::config(format!("bad bind address: {}", e)))?;

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router)
        .await
        .map_err(|e| ExpenseOpsError::internal(format!("http server: {}", e)))?;
    Ok(())
}
