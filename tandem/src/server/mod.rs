//! WebSocket server: wire protocol, subscriber pool and command routing.

pub mod pool;
pub mod protocol;
pub mod registry;
pub mod ws;

use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Span, info};

use crate::{Error, Result};

pub use pool::{Connection, ConnectionPool};
pub use registry::HandlerRegistry;
pub use ws::WsState;

/// Router for the daemon with request tracing.
pub fn build_router(state: WsState) -> Router {
    ws::router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                let mut make_span =
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO);
                use tower_http::trace::MakeSpan;
                make_span.make_span(req)
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                    let on_response =
                        tower_http::trace::DefaultOnResponse::new().level(tracing::Level::DEBUG);
                    use tower_http::trace::OnResponse;
                    on_response.on_response(res, latency, span);
                },
            ),
    )
}

/// Serve `router` on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("WebSocket server listening on ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("WebSocket server shutting down...");
        })
        .await
        .map_err(|e| Error::Other(format!("Server error: {e}")))?;

    Ok(())
}
