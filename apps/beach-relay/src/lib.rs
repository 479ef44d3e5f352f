//! Beach signaling relay.
//!
//! Endpoints register either a websocket (`/:id`) or an event stream
//! (`/messages/:id`); envelopes are routed to the single live channel that
//! holds the destination id. Stream clients send with `POST /message`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod registry;
pub mod routes;
pub mod socket;
pub mod state;
pub mod stream;
pub mod telemetry;

pub use config::{Cli, RelayConfig};
pub use error::{ApiError, RelayError};
pub use registry::{ChannelMode, CloseReason, EndpointRegistry};
pub use routes::router;
pub use state::RelayState;

/// Serve the relay on `listener` until `shutdown` resolves, then drain every
/// channel and wait for connections to finish.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let heartbeat = heartbeat::spawn(
        Arc::clone(&state.registry),
        state.config.heartbeat_interval,
        state.config.max_missed_pongs,
    );
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(%addr, "beach-relay listening");

    let draining = Arc::clone(&state);
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            draining.drain();
        })
        .await
        .context("relay server failed");

    heartbeat.abort();
    result
}
