// src/core/handler/actions/session.rs

//! `SESSION CREATE`, and the `SESSION ADD`/`SESSION REMOVE` pair of primary
//! sessions.

use super::dest::signature_type;
use crate::connection::{ConnectionInfo, SessionState};
use crate::core::handler::command_router::RouteResponse;
use crate::core::protocol::{Capabilities, CommandLine, Props, Reply};
use crate::core::registry::SessionRecord;
use crate::core::sessions::message::{Delivery, MessageDefaults, MessageSessionConfig};
use crate::core::sessions::primary::SubTarget;
use crate::core::sessions::stream::{self, Direction, StreamSessionConfig};
use crate::core::sessions::{
    MessageSession, MessageStyle, Owner, PrimarySession, SessionKind, StreamSession, Style,
};
use crate::core::state::GatewayState;
use crate::core::{ResultCode, SamError};
use crate::transport::{PROTO_DATAGRAM, PROTO_RAW, PROTO_STREAMING, TransportSession};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Keys that configure the gateway and never reach the transport.
const CONTROL_KEYS: &[&str] = &[
    "STYLE",
    "DESTINATION",
    "ID",
    "DIRECTION",
    "SIGNATURE_TYPE",
    "HOST",
    "PORT",
    "PROTOCOL",
    "FROM_PORT",
    "TO_PORT",
    "LISTEN_PORT",
    "LISTEN_PROTOCOL",
    "HEADER",
    "SILENT",
    "USER",
    "PASSWORD",
];

/// Keys that belong to sub-sessions and are refused on a primary.
const PRIMARY_RESERVED_KEYS: &[&str] = &[
    "PORT",
    "HOST",
    "FROM_PORT",
    "TO_PORT",
    "PROTOCOL",
    "LISTEN_PORT",
    "LISTEN_PROTOCOL",
];

const RELIABILITY_OPTION: &str = "i2cp.messageReliability";

fn parse_style(props: &Props) -> Result<Style, SamError> {
    let raw = props.require("STYLE")?;
    raw.parse::<Style>().map_err(|_| SamError::InvalidValue {
        key: "STYLE",
        value: raw.to_string(),
    })
}

/// The options handed to the transport: configured defaults overlaid with the
/// client's own, control keys removed.
fn transport_options(state: &GatewayState, caps: &Capabilities, props: &Props) -> Props {
    let defaults: Props = state
        .config
        .transport
        .options
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut options = props.without(CONTROL_KEYS).layered_over(&defaults);
    if caps.force_unreliable {
        options.insert(RELIABILITY_OPTION, "none");
    }
    options
}

/// Where inbound messages of a new message session go.
async fn delivery_for(
    state: &GatewayState,
    conn: &ConnectionInfo,
    style: MessageStyle,
    props: &Props,
) -> Result<Delivery, SamError> {
    let Some(port) = props.parse::<u16>("PORT")? else {
        return Ok(Delivery::Client);
    };
    let socket = state.datagram_socket().ok_or_else(|| {
        SamError::InvalidState("the datagram side channel is disabled".to_string())
    })?;
    let target = match props.get("HOST") {
        Some(host) => resolve_host(host, port).await?,
        None => SocketAddr::new(conn.addr.ip(), port),
    };
    Ok(Delivery::Forward {
        socket,
        target,
        header: style == MessageStyle::Raw && props.flag("HEADER"),
    })
}

pub(super) async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, SamError> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| SamError::InvalidValue {
            key: "HOST",
            value: host.to_string(),
        })
}

/// Resolves `DESTINATION=` into `(keystream, value echoed in the reply)`.
async fn resolve_keystream(
    state: &GatewayState,
    caps: &Capabilities,
    props: &Props,
) -> Result<(String, String), SamError> {
    let destination = props.require("DESTINATION")?;
    if destination.eq_ignore_ascii_case("TRANSIENT") {
        let keys = state.transport.generate_keys(signature_type(props)?).await?;
        return Ok((keys.private.clone(), keys.private));
    }
    if caps.named_destinations {
        let keystream = match state.keys.get(destination) {
            Some(keystream) => keystream,
            None => {
                let keys = state.transport.generate_keys(signature_type(props)?).await?;
                state.keys.insert_if_absent(destination, keys.private).await?
            }
        };
        return Ok((keystream, destination.to_string()));
    }
    state.transport.destination_of(destination)?;
    Ok((destination.to_string(), destination.to_string()))
}

/// Handles `SESSION CREATE`.
///
/// The nickname and destination are reserved before the transport binding is
/// created. Any failure afterwards drops the reservation, so nothing of the
/// attempt stays in the registry.
pub async fn create(
    state: &Arc<GatewayState>,
    conn: &ConnectionInfo,
    session: &mut SessionState,
    caps: &Capabilities,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    let props = &line.props;
    if session.session.is_some() {
        return Err(SamError::InvalidState(
            "a session is already open on this connection".to_string(),
        ));
    }
    let style = parse_style(props)?;
    if style == Style::Primary {
        if !caps.primary_sessions {
            return Err(SamError::InvalidState(format!(
                "PRIMARY sessions need protocol 3, this connection speaks {}",
                caps.version
            )));
        }
        if let Some(key) = PRIMARY_RESERVED_KEYS.iter().find(|k| props.contains(k)) {
            return Err(SamError::InvalidState(format!(
                "{key} belongs on a sub-session, not on a PRIMARY session"
            )));
        }
    }

    let nickname = if caps.explicit_ids {
        props.require("ID")?.to_string()
    } else {
        format!("v{}-{}", caps.version.major, conn.conn_id)
    };

    // Everything that can be rejected up front is checked before any
    // transport binding exists.
    let direction = if caps.directions && style == Style::Stream {
        props.parse::<Direction>("DIRECTION")?.unwrap_or_default()
    } else {
        Direction::Both
    };
    let message_setup = match style {
        Style::Datagram | Style::Raw => {
            let message_style = if style == Style::Raw {
                MessageStyle::Raw
            } else {
                MessageStyle::Datagram
            };
            let defaults = MessageDefaults::from_props(message_style, props)?;
            let delivery = delivery_for(state, conn, message_style, props).await?;
            Some((message_style, defaults, delivery))
        }
        _ => None,
    };

    let (keystream, reply_destination) = resolve_keystream(state, caps, props).await?;
    let public = state.transport.destination_of(&keystream)?;
    let options = transport_options(state, caps, props);

    let reservation = state.registry.reserve(SessionRecord::new(
        nickname.clone(),
        public,
        keystream.clone(),
        options.clone(),
        style,
        conn.conn_id,
        None,
    ))?;
    let transport = state.transport.create_session(&keystream, &options).await?;
    let group = reservation.record().group.clone();
    let owner = Owner {
        conn_id: conn.conn_id,
        writer: conn.writer.clone(),
        kill: Some(conn.kill.clone()),
    };

    let record = if let Some((message_style, defaults, delivery)) = message_setup {
        let config = MessageSessionConfig {
            nickname: nickname.clone(),
            style: message_style,
            defaults,
            delivery,
            report_ports: caps.explicit_ids,
        };
        let message = MessageSession::new(config, transport, true, owner);
        let kind = match message_style {
            MessageStyle::Datagram => SessionKind::Datagram(message.clone()),
            MessageStyle::Raw => SessionKind::Raw(message.clone()),
        };
        let record = reservation.commit(kind);
        message.start(&record.group);
        record
    } else if style == Style::Primary {
        let primary = PrimarySession::new(nickname.clone(), transport, owner);
        let record = reservation.commit(SessionKind::Primary(primary.clone()));
        primary.start(&record.group);
        record
    } else {
        let (inbound_tx, inbound_rx) = stream::inbound_channel();
        let config = StreamSessionConfig {
            nickname: nickname.clone(),
            caps: *caps,
            direction,
            connect_timeout: state.config.connect_timeout,
        };
        let stream = StreamSession::new(config, transport, true, owner, group, inbound_rx);
        let record = reservation.commit(SessionKind::Stream(stream.clone()));
        stream.start(direction.can_accept().then_some(inbound_tx));
        record
    };

    info!(
        "Connection {} created {} session '{nickname}'.",
        conn.conn_id, style
    );
    session.session = Some(record);
    Ok(RouteResponse::Reply(
        Reply::new("SESSION STATUS")
            .result(ResultCode::Ok)
            .field("DESTINATION", reply_destination),
    ))
}

/// The primary session owned by this connection.
fn own_primary(session: &SessionState) -> Result<(Arc<SessionRecord>, Arc<PrimarySession>), SamError> {
    let record = session
        .session
        .clone()
        .ok_or_else(|| SamError::InvalidState("no session on this connection".to_string()))?;
    let primary = record
        .session()
        .and_then(|s| s.as_primary().cloned())
        .ok_or_else(|| SamError::InvalidState("the session is not a PRIMARY session".to_string()))?;
    Ok((record, primary))
}

/// The `(protocol, port)` a new sub-session listens on.
fn listen_address(style: Style, props: &Props) -> Result<(u8, u16), SamError> {
    let port = match props.parse::<u16>("LISTEN_PORT")? {
        Some(port) => port,
        None => props.parse::<u16>("FROM_PORT")?.unwrap_or(0),
    };
    let protocol = match style {
        Style::Stream => PROTO_STREAMING,
        Style::Datagram => PROTO_DATAGRAM,
        Style::Raw => match props.parse::<u8>("LISTEN_PROTOCOL")? {
            Some(protocol) => protocol,
            None => props.parse::<u8>("PROTOCOL")?.unwrap_or(PROTO_RAW),
        },
        Style::Primary => {
            return Err(SamError::InvalidState(
                "a PRIMARY session cannot be a sub-session".to_string(),
            ));
        }
    };
    if style == Style::Raw && (protocol == PROTO_STREAMING || protocol == PROTO_DATAGRAM) {
        return Err(SamError::InvalidValue {
            key: "LISTEN_PROTOCOL",
            value: protocol.to_string(),
        });
    }
    Ok((protocol, port))
}

/// Handles `SESSION ADD`: a sub-session sharing the primary's binding.
pub async fn add(
    state: &Arc<GatewayState>,
    conn: &ConnectionInfo,
    session: &mut SessionState,
    caps: &Capabilities,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    let props = &line.props;
    let (primary_record, primary) = own_primary(session)?;
    if props.contains("DESTINATION") {
        return Err(SamError::InvalidState(
            "sub-sessions share the PRIMARY destination; DESTINATION is not allowed".to_string(),
        ));
    }
    let style = parse_style(props)?;
    let nickname = props.require("ID")?.to_string();
    let (protocol, port) = listen_address(style, props)?;
    let message_style = match style {
        Style::Raw => Some(MessageStyle::Raw),
        Style::Datagram => Some(MessageStyle::Datagram),
        _ => None,
    };
    let message_setup = match message_style {
        Some(message_style) => Some((
            message_style,
            MessageDefaults::from_props(message_style, props)?,
            delivery_for(state, conn, message_style, props).await?,
        )),
        None => None,
    };

    let options = transport_options(state, caps, props).layered_over(&primary_record.props);
    let reservation = state.registry.reserve(SessionRecord::new(
        nickname.clone(),
        primary_record.destination.clone(),
        primary_record.keystream.clone(),
        options,
        style,
        conn.conn_id,
        Some(primary_record.nickname.clone()),
    ))?;
    let transport: Arc<dyn TransportSession> = primary.transport();
    let owner = Owner {
        conn_id: conn.conn_id,
        writer: conn.writer.clone(),
        kill: Some(conn.kill.clone()),
    };

    let (kind, target) = match message_setup {
        None => {
            let (inbound_tx, inbound_rx) = stream::inbound_channel();
            let config = StreamSessionConfig {
                nickname: nickname.clone(),
                caps: *caps,
                direction: Direction::Both,
                connect_timeout: state.config.connect_timeout,
            };
            let group = reservation.record().group.clone();
            let stream = StreamSession::new(config, transport, false, owner, group, inbound_rx);
            (SessionKind::Stream(stream), SubTarget::Stream(inbound_tx))
        }
        Some((message_style, defaults, delivery)) => {
            let config = MessageSessionConfig {
                nickname: nickname.clone(),
                style: message_style,
                defaults,
                delivery,
                report_ports: true,
            };
            let message = MessageSession::new(config, transport, false, owner);
            let kind = match message_style {
                MessageStyle::Datagram => SessionKind::Datagram(message.clone()),
                MessageStyle::Raw => SessionKind::Raw(message.clone()),
            };
            (kind, SubTarget::Message(message))
        }
    };

    primary.add(&nickname, protocol, port, target)?;
    reservation.commit(kind);
    Ok(RouteResponse::Reply(
        Reply::new("SESSION STATUS")
            .result(ResultCode::Ok)
            .field("ID", &nickname)
            .field("MESSAGE", format!("ADD {nickname}")),
    ))
}

/// Handles `SESSION REMOVE`. Only sub-sessions of this connection's primary
/// can be removed.
pub async fn remove(
    state: &Arc<GatewayState>,
    session: &mut SessionState,
    line: &CommandLine,
) -> Result<RouteResponse, SamError> {
    let (primary_record, primary) = own_primary(session)?;
    let nickname = line.props.require("ID")?;
    let is_child = state
        .registry
        .get(nickname)
        .is_some_and(|r| r.parent.as_deref() == Some(primary_record.nickname.as_str()));
    if !is_child {
        return Err(SamError::InvalidId(nickname.to_string()));
    }
    primary.remove(nickname);
    state.registry.close(nickname).await;
    Ok(RouteResponse::Reply(
        Reply::new("SESSION STATUS")
            .result(ResultCode::Ok)
            .field("ID", nickname)
            .field("MESSAGE", format!("REMOVE {nickname}")),
    ))
}
