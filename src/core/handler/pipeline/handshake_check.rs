// src/core/handler/pipeline/handshake_check.rs

//! Pipeline step for connections that have not negotiated a version yet.

use crate::connection::SessionState;
use crate::core::handler::actions;
use crate::core::handler::command_router::RouteResponse;
use crate::core::protocol::{CommandLine, Reply};
use crate::core::state::GatewayState;
use crate::core::{ResultCode, SamError};
use std::sync::Arc;

/// Only `HELLO VERSION` is accepted before the handshake; anything else ends
/// the connection.
pub async fn expect_hello(
    state: &Arc<GatewayState>,
    session: &mut SessionState,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    if line.domain != "HELLO" {
        return Ok(RouteResponse::Close(
            Reply::new("HELLO REPLY")
                .result(ResultCode::I2pError)
                .field("MESSAGE", format!("expected HELLO, got {}", line.name())),
        ));
    }
    actions::connection::hello(state, session, line).await
}
