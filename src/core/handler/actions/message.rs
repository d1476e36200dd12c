// src/core/handler/actions/message.rs

use crate::connection::SessionState;
use crate::core::handler::command_router::RouteResponse;
use crate::core::protocol::CommandLine;
use crate::core::sessions::MessageStyle;
use crate::core::state::GatewayState;
use crate::core::SamError;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Handles `DATAGRAM SEND` and `RAW SEND` through this connection's own
/// message session. Success has no reply.
pub async fn send(
    state: &Arc<GatewayState>,
    session: &SessionState,
    line: &CommandLine,
    payload: Option<Bytes>,
) -> Result<RouteResponse, SamError> {
    let payload = payload.ok_or(SamError::MissingProperty("SIZE"))?;
    let wanted = if line.domain == "RAW" {
        MessageStyle::Raw
    } else {
        MessageStyle::Datagram
    };
    let message = session
        .session
        .as_ref()
        .and_then(|r| r.session())
        .and_then(|s| s.as_message().cloned())
        .filter(|m| m.style() == wanted)
        .ok_or_else(|| {
            SamError::InvalidState(format!("no {} session on this connection", wanted.domain()))
        })?;

    let destination = state
        .resolve_destination(line.props.require("DESTINATION")?)
        .await?;
    if !message.send(&destination, payload, &line.props).await? {
        debug!("{} SEND to a peer the transport refused.", wanted.domain());
    }
    Ok(RouteResponse::NoReply)
}
