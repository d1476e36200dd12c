// src/core/handler/command_router.rs

//! The central component for routing parsed command lines to their handlers.
//!
//! The `Router` receives one `CommandLine` (and the payload the connection
//! handler already read for it) and runs it through the pipeline: the
//! handshake gate, the per-command credential check, then dispatch by domain
//! and opcode to the capability-appropriate action.

use super::actions;
use super::pipeline::{auth_check, handshake_check};
use crate::connection::{ConnectionInfo, SessionState};
use crate::core::metrics;
use crate::core::protocol::{Capabilities, CommandLine, Props, Reply};
use crate::core::sessions::StreamSession;
use crate::core::sessions::stream::AcceptTicket;
use crate::core::state::GatewayState;
use crate::core::SamError;
use crate::transport::ConnectOptions;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, info_span};

/// What the connection handler should do after a command.
pub enum RouteResponse {
    /// Write one line and keep going.
    Reply(Reply),
    /// Nothing to write (successful `STREAM SEND` in protocol 1, message sends).
    NoReply,
    /// Write one line, then end the connection.
    Close(Reply),
    /// Give the client socket to a stream session (protocol 3).
    HandOff(HandOff),
}

/// A protocol 3 stream command that takes over the client connection.
pub enum HandOff {
    Accept {
        session: Arc<StreamSession>,
        ticket: AcceptTicket,
        silent: bool,
    },
    Connect {
        session: Arc<StreamSession>,
        destination: String,
        options: ConnectOptions,
        silent: bool,
    },
}

/// The `Router` receives a parsed command line and directs it through the
/// processing pipeline.
pub struct Router<'a> {
    state: Arc<GatewayState>,
    conn: &'a ConnectionInfo,
    session: &'a mut SessionState,
}

impl<'a> Router<'a> {
    pub fn new(state: Arc<GatewayState>, conn: &'a ConnectionInfo, session: &'a mut SessionState) -> Self {
        Self {
            state,
            conn,
            session,
        }
    }

    /// Routes one command and records its metrics.
    pub async fn route(&mut self, line: CommandLine, payload: Option<Bytes>) -> Result<RouteResponse, SamError> {
        let span = info_span!(
            "command",
            name = %line.name(),
            client.addr = %self.conn.addr,
            client.id = %self.conn.conn_id,
        );

        async move {
            let start_time = Instant::now();
            metrics::COMMANDS_PROCESSED_TOTAL
                .with_label_values(&[domain_label(&line.domain)])
                .inc();

            let result = match self.session.caps {
                None => handshake_check::expect_hello(&self.state, self.session, &line).await,
                Some(caps) => {
                    auth_check::check_credentials(&self.state, self.session, &line).await?;
                    self.dispatch(caps, line, payload).await
                }
            };

            metrics::COMMAND_LATENCY_SECONDS.observe(start_time.elapsed().as_secs_f64());
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &mut self,
        caps: Capabilities,
        line: CommandLine,
        payload: Option<Bytes>,
    ) -> Result<RouteResponse, SamError> {
        let opcode = line.opcode.as_deref().unwrap_or("");
        let state = &self.state;
        let conn = self.conn;
        let session = &mut *self.session;

        match (line.domain.as_str(), opcode) {
            ("HELLO", _) => Err(SamError::InvalidState(
                "protocol version already negotiated".to_string(),
            )),

            ("SESSION", "CREATE") => actions::session::create(state, conn, session, &caps, &line).await,
            ("SESSION", "ADD") if caps.primary_sessions => {
                actions::session::add(state, conn, session, &caps, &line).await
            }
            ("SESSION", "REMOVE") if caps.primary_sessions => {
                actions::session::remove(state, session, &line).await
            }

            ("STREAM", "CONNECT") => actions::stream::connect(state, session, &caps, &line).await,
            ("STREAM", "ACCEPT") if caps.explicit_ids => actions::stream::accept(state, session, &line),
            ("STREAM", "FORWARD") if caps.explicit_ids => {
                actions::stream::forward(state, conn, session, &line).await
            }
            ("STREAM", "SEND") if !caps.explicit_ids => {
                actions::stream::send(session, &caps, &line, payload).await
            }
            ("STREAM", "RECEIVE") if caps.receive_limits => actions::stream::receive(session, &line),
            ("STREAM", "CLOSE") if !caps.explicit_ids => actions::stream::close(session, &line),

            ("DATAGRAM" | "RAW", "SEND") => {
                actions::message::send(state, session, &line, payload).await
            }

            ("NAMING", "LOOKUP") => actions::naming::lookup(state, session, &line).await,
            ("DEST", "GENERATE") => actions::dest::generate(state, &line).await,

            ("AUTH", _) if caps.auth_commands => actions::auth::handle_auth(state, session, &line).await,

            ("PING", _) if caps.keepalive => Ok(actions::connection::ping(&line)),
            ("PONG", _) if caps.keepalive => Ok(actions::connection::pong(session, &line)),
            ("QUIT" | "STOP" | "EXIT", _) if caps.keepalive => Ok(actions::connection::quit()),

            _ => Err(SamError::UnknownCommand(line.name())),
        }
    }
}

/// The metric label for a domain. Unknown domains share one label.
fn domain_label(domain: &str) -> &'static str {
    match domain {
        "HELLO" => "HELLO",
        "SESSION" => "SESSION",
        "STREAM" => "STREAM",
        "DATAGRAM" => "DATAGRAM",
        "RAW" => "RAW",
        "NAMING" => "NAMING",
        "DEST" => "DEST",
        "AUTH" => "AUTH",
        "PING" | "PONG" => "PING",
        _ => "OTHER",
    }
}

/// Builds the reply a failed command gets, in the reply vocabulary of its domain.
pub fn error_reply(domain: &str, props: &Props, err: &SamError) -> Reply {
    let head = match domain {
        "HELLO" => "HELLO REPLY",
        "STREAM" => "STREAM STATUS",
        "DATAGRAM" => "DATAGRAM STATUS",
        "RAW" => "RAW STATUS",
        "NAMING" => "NAMING REPLY",
        "DEST" => "DEST REPLY",
        "AUTH" => "AUTH STATUS",
        _ => "SESSION STATUS",
    };
    let mut reply = Reply::new(head).result(err.result_code());
    match domain {
        "STREAM" => reply = reply.field_opt("ID", props.get("ID")),
        "NAMING" => reply = reply.field_opt("NAME", props.get("NAME")),
        _ => {}
    }
    reply.field("MESSAGE", err.to_string())
}
