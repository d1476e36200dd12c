// src/core/handler/pipeline/auth_check.rs

//! Pipeline step enforcing client authentication after the handshake.

use crate::connection::SessionState;
use crate::core::protocol::CommandLine;
use crate::core::state::GatewayState;
use crate::core::SamError;
use std::sync::Arc;

/// While authentication is required and this connection has not yet
/// authenticated, every command must carry a valid `USER`/`PASSWORD` pair.
/// Keepalive traffic is exempt.
pub async fn check_credentials(
    state: &Arc<GatewayState>,
    session: &mut SessionState,
    line: &CommandLine,
) -> Result<(), SamError> {
    if session.is_authenticated || !state.auth.is_required() {
        return Ok(());
    }
    if matches!(line.domain.as_str(), "PING" | "PONG") {
        return Ok(());
    }
    state.auth.authenticate(&line.props).await?;
    session.is_authenticated = true;
    Ok(())
}
