//! `/subscribez`: WebSocket upgrade for stub clients.

use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::state::RelayEventType;
use crate::tunnel::subscriber;
use crate::AppState;

/// Upgrade the request and hand the socket to a connection actor.
///
/// A request that cannot be upgraded gets axum's rejection response and is
/// recorded as an `upgrade_failed` event. No connection is registered.
pub async fn subscribe(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(error = %rejection, "Rejected tunnel upgrade");
            state
                .stats
                .push_event(RelayEventType::UpgradeFailed, rejection.body_text())
                .await;
            return rejection.into_response();
        }
    };

    let max_message_size = state.config.max_message_size();
    let stats = state.stats.clone();
    ws.max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_failed_upgrade(move |e: axum::Error| {
            warn!(error = %e, "Tunnel upgrade failed after handshake");
            tokio::spawn(async move {
                stats
                    .push_event(RelayEventType::UpgradeFailed, e.to_string())
                    .await;
            });
        })
        .on_upgrade(move |socket| async move {
            subscriber::serve(socket, state.hub.clone(), &state.config.tunnel).await;
        })
}
