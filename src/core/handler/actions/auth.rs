// src/core/handler/actions/auth.rs

use crate::connection::SessionState;
use crate::core::handler::command_router::RouteResponse;
use crate::core::protocol::{CommandLine, Reply};
use crate::core::state::GatewayState;
use crate::core::{ResultCode, SamError};
use std::sync::Arc;

/// Handles `AUTH ENABLE|DISABLE|ADD|REMOVE`.
pub async fn handle_auth(
    state: &Arc<GatewayState>,
    session: &mut SessionState,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    match line.opcode.as_deref() {
        Some("ENABLE") => {
            state.auth.set_required(true);
            // The connection that turned authentication on stays usable.
            session.is_authenticated = true;
        }
        Some("DISABLE") => state.auth.set_required(false),
        Some("ADD") => {
            let user = line.props.require("USER")?;
            let password = line.props.require("PASSWORD")?;
            state.auth.add_user(user, password).await?;
        }
        Some("REMOVE") => {
            let user = line.props.require("USER")?;
            state.auth.remove_user(user).await?;
        }
        _ => return Err(SamError::UnknownCommand(line.name())),
    }
    Ok(RouteResponse::Reply(
        Reply::new("AUTH STATUS").result(ResultCode::Ok),
    ))
}
