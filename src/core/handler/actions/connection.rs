// src/core/handler/actions/connection.rs

use crate::connection::SessionState;
use crate::core::handler::command_router::RouteResponse;
use crate::core::protocol::version::negotiate;
use crate::core::protocol::{Capabilities, CommandLine, Reply};
use crate::core::state::GatewayState;
use crate::core::{ResultCode, SamError};
use std::sync::Arc;
use tracing::debug;

/// Handles `HELLO VERSION`, fixing the connection's capabilities.
pub async fn hello(
    state: &Arc<GatewayState>,
    session: &mut SessionState,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    if line.opcode.as_deref() != Some("VERSION") {
        return Err(SamError::Malformed("expected HELLO VERSION".to_string()));
    }
    let version = negotiate(line.props.get("MIN"), line.props.get("MAX"))?;

    if state.auth.is_required() {
        state.auth.authenticate(&line.props).await?;
        session.is_authenticated = true;
    }

    session.caps = Some(Capabilities::for_version(version));
    debug!("Negotiated protocol version {version}.");
    Ok(RouteResponse::Reply(
        Reply::new("HELLO REPLY")
            .result(ResultCode::Ok)
            .field("VERSION", version),
    ))
}

/// Answers a client `PING` with `PONG` and the same text.
pub fn ping(line: &CommandLine) -> RouteResponse {
    let text = line.rest.trim();
    if text.is_empty() {
        RouteResponse::Reply(Reply::raw("PONG"))
    } else {
        RouteResponse::Reply(Reply::raw(format!("PONG {text}")))
    }
}

/// Records the client's answer to a gateway `PING`.
pub fn pong(session: &mut SessionState, line: &CommandLine) -> RouteResponse {
    if !session.ping.answer(&line.rest) {
        debug!("Ignoring PONG that answers no outstanding PING.");
    }
    RouteResponse::NoReply
}

pub fn quit() -> RouteResponse {
    RouteResponse::Close(
        Reply::new("SESSION STATUS")
            .result(ResultCode::Ok)
            .field("MESSAGE", "bye"),
    )
}
