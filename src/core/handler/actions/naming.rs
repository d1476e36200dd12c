// src/core/handler/actions/naming.rs

use crate::connection::SessionState;
use crate::core::handler::command_router::RouteResponse;
use crate::core::protocol::{CommandLine, Reply};
use crate::core::state::GatewayState;
use crate::core::{ResultCode, SamError};
use std::sync::Arc;

/// Handles `NAMING LOOKUP NAME=...`. `ME` is this connection's own destination.
pub async fn lookup(
    state: &Arc<GatewayState>,
    session: &SessionState,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    let name = line.props.require("NAME")?;
    let value = if name == "ME" {
        session
            .session
            .as_ref()
            .map(|r| r.destination.clone())
            .ok_or_else(|| SamError::InvalidKey("no session on this connection".to_string()))?
    } else if state.transport.validate_destination(name).is_ok() {
        name.to_string()
    } else {
        state
            .naming
            .lookup(name)
            .await
            .ok_or_else(|| SamError::KeyNotFound(name.to_string()))?
    };
    Ok(RouteResponse::Reply(
        Reply::new("NAMING REPLY")
            .result(ResultCode::Ok)
            .field("NAME", name)
            .field("VALUE", value),
    ))
}
