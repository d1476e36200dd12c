// src/core/handler/actions/stream.rs

//! The `STREAM` commands. Protocol 1 and 2 address streams of this
//! connection's session by integer id; protocol 3 names a session by nickname
//! and takes over the issuing connection.

use super::session::resolve_host;
use crate::connection::{ConnectionInfo, SessionState};
use crate::core::handler::command_router::{HandOff, RouteResponse};
use crate::core::protocol::{Capabilities, CommandLine, Props, Reply, SendPolicy};
use crate::core::sessions::StreamSession;
use crate::core::sessions::stream::SendOutcome;
use crate::core::state::GatewayState;
use crate::core::{ResultCode, SamError};
use crate::transport::ConnectOptions;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// The stream session this connection created (protocol 1 and 2).
fn own_stream(session: &SessionState) -> Result<Arc<StreamSession>, SamError> {
    session
        .session
        .as_ref()
        .and_then(|r| r.session())
        .and_then(|s| s.as_stream().cloned())
        .ok_or_else(|| SamError::InvalidState("no STREAM session on this connection".to_string()))
}

/// The stream session named by `ID=` (protocol 3). The issuing connection
/// must not own a session itself.
fn named_stream(
    state: &GatewayState,
    session: &SessionState,
    props: &Props,
) -> Result<Arc<StreamSession>, SamError> {
    if session.session.is_some() {
        return Err(SamError::InvalidState(
            "STREAM commands go on a new connection, not the session's own".to_string(),
        ));
    }
    let nickname = props.require("ID")?;
    let record = state
        .registry
        .get(nickname)
        .ok_or_else(|| SamError::InvalidId(nickname.to_string()))?;
    record
        .session()
        .and_then(|s| s.as_stream().cloned())
        .ok_or_else(|| SamError::InvalidId(format!("'{nickname}' is not a STREAM session")))
}

fn stream_id(props: &Props) -> Result<i64, SamError> {
    props
        .parse::<i64>("ID")?
        .ok_or(SamError::MissingProperty("ID"))
}

fn connect_options(props: &Props) -> Result<ConnectOptions, SamError> {
    Ok(ConnectOptions {
        from_port: props.parse::<u16>("FROM_PORT")?.unwrap_or(0),
        to_port: props.parse::<u16>("TO_PORT")?.unwrap_or(0),
        timeout: None,
    })
}

/// `STREAM CLOSED RESULT=INVALID_ID ID=n`, the answer to any unknown id.
fn invalid_id(id: i64) -> RouteResponse {
    RouteResponse::Reply(
        Reply::new("STREAM CLOSED")
            .result(ResultCode::InvalidId)
            .field("ID", id),
    )
}

/// Handles `STREAM CONNECT`.
pub async fn connect(
    state: &Arc<GatewayState>,
    session: &SessionState,
    caps: &Capabilities,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    let props = &line.props;

    if caps.explicit_ids {
        let stream = named_stream(state, session, props)?;
        let destination = state
            .resolve_destination(props.require("DESTINATION")?)
            .await?;
        return Ok(RouteResponse::HandOff(HandOff::Connect {
            session: stream,
            destination,
            options: connect_options(props)?,
            silent: props.flag("SILENT"),
        }));
    }

    let stream = own_stream(session)?;
    let id = stream_id(props)?;
    if id < 1 {
        return Err(SamError::InvalidId(format!("{id} (CONNECT ids start at 1)")));
    }
    let destination = state
        .resolve_destination(props.require("DESTINATION")?)
        .await?;
    let options = connect_options(props)?;
    stream.reserve(id)?;

    if caps.async_connect {
        stream.spawn_connect(id, destination, options);
        return Ok(RouteResponse::NoReply);
    }
    stream.connect(id, &destination, options).await?;
    Ok(RouteResponse::Reply(
        Reply::new("STREAM STATUS")
            .result(ResultCode::Ok)
            .field("ID", id),
    ))
}

/// Handles `STREAM ACCEPT` (protocol 3). The ticket is taken now, so a second
/// concurrent accept fails with `ALREADY_ACCEPTING`.
pub fn accept(
    state: &Arc<GatewayState>,
    session: &SessionState,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    let stream = named_stream(state, session, &line.props)?;
    let ticket = stream.try_accept()?;
    Ok(RouteResponse::HandOff(HandOff::Accept {
        session: stream,
        ticket,
        silent: line.props.flag("SILENT"),
    }))
}

/// Handles `STREAM FORWARD` (protocol 3). Forwarding stops when this
/// connection ends.
pub async fn forward(
    state: &Arc<GatewayState>,
    conn: &ConnectionInfo,
    session: &mut SessionState,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    let props = &line.props;
    let stream = named_stream(state, session, props)?;
    let port = props
        .parse::<u16>("PORT")?
        .ok_or(SamError::MissingProperty("PORT"))?;
    let target = match props.get("HOST") {
        Some(host) => resolve_host(host, port).await?,
        None => std::net::SocketAddr::new(conn.addr.ip(), port),
    };
    let ticket = stream.try_accept()?;
    let handle = stream
        .forward(ticket, target, props.flag("SILENT"))
        .ok_or_else(|| SamError::InvalidState("the session is closing".to_string()))?;
    session.forwarders.push(handle);
    Ok(RouteResponse::Reply(
        Reply::new("STREAM STATUS").result(ResultCode::Ok),
    ))
}

/// Handles `STREAM SEND` (protocol 1 and 2). The payload was read by the
/// connection handler.
pub async fn send(
    session: &SessionState,
    caps: &Capabilities,
    line: &CommandLine,
    payload: Option<Bytes>,
) -> Result<RouteResponse, SamError> {
    let id = stream_id(&line.props)?;
    let payload = payload.ok_or(SamError::MissingProperty("SIZE"))?;
    let stream = own_stream(session)?;

    match caps.send_policy {
        SendPolicy::Blocking => match stream.send_blocking(id, payload).await {
            Ok(()) => Ok(RouteResponse::NoReply),
            Err(SamError::InvalidId(_)) => Ok(invalid_id(id)),
            Err(e) => {
                // The sender worker reports the failure as STREAM CLOSED.
                debug!("STREAM SEND on {id} failed: {e}");
                Ok(RouteResponse::NoReply)
            }
        },
        SendPolicy::Credit => {
            let reply = Reply::new("STREAM SEND").field("ID", id);
            match stream.send_credit(id, payload) {
                Ok(SendOutcome::Queued { buffer_full }) => Ok(RouteResponse::Reply(
                    reply
                        .result(ResultCode::Ok)
                        .field("STATE", if buffer_full { "BUFFER_FULL" } else { "READY" }),
                )),
                Ok(SendOutcome::Rejected) => Ok(RouteResponse::Reply(
                    reply.field("RESULT", "FAILED").field("STATE", "BUFFER_FULL"),
                )),
                Err(SamError::InvalidId(_)) => Ok(invalid_id(id)),
                Err(e) => Err(e),
            }
        }
        SendPolicy::Spliced => Err(SamError::UnknownCommand(line.name())),
    }
}

/// Handles `STREAM RECEIVE ID=n LIMIT=bytes|NONE` (protocol 2).
pub fn receive(session: &SessionState, line: &CommandLine) -> Result<RouteResponse, SamError> {
    let id = stream_id(&line.props)?;
    let raw = line.props.require("LIMIT")?;
    let limit = if raw.eq_ignore_ascii_case("NONE") {
        None
    } else {
        Some(raw.parse::<u64>().map_err(|_| SamError::InvalidValue {
            key: "LIMIT",
            value: raw.to_string(),
        })?)
    };
    let stream = own_stream(session)?;
    let result = match stream.set_receive_limit(id, limit) {
        Ok(()) => ResultCode::Ok,
        Err(SamError::InvalidId(_)) => ResultCode::InvalidId,
        Err(e) => return Err(e),
    };
    Ok(RouteResponse::Reply(
        Reply::new("STREAM RECEIVE").result(result).field("ID", id),
    ))
}

/// Handles `STREAM CLOSE` (protocol 1 and 2). Closing an unknown id changes
/// nothing and answers `INVALID_ID`.
pub fn close(session: &SessionState, line: &CommandLine) -> Result<RouteResponse, SamError> {
    let id = stream_id(&line.props)?;
    let stream = own_stream(session)?;
    match stream.close_stream(id) {
        Ok(()) => Ok(RouteResponse::Reply(
            Reply::new("STREAM CLOSED")
                .result(ResultCode::Ok)
                .field("ID", id),
        )),
        Err(SamError::InvalidId(_)) => Ok(invalid_id(id)),
        Err(e) => Err(e),
    }
}
