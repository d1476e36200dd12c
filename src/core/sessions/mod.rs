// src/core/sessions/mod.rs

//! The four session styles a client can create, and what they share.

pub mod message;
pub mod primary;
pub mod stream;

use crate::connection::ClientWriter;
use crate::core::protocol::Reply;
use crate::core::ResultCode;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;
use tracing::warn;

pub use message::{MessageSession, MessageStyle};
pub use primary::PrimarySession;
pub use stream::StreamSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Style {
    #[strum(serialize = "STREAM")]
    Stream,
    #[strum(serialize = "DATAGRAM")]
    Datagram,
    #[strum(serialize = "RAW")]
    Raw,
    #[strum(to_string = "PRIMARY", serialize = "MASTER")]
    Primary,
}

/// A live session of any style.
#[derive(Clone)]
pub enum SessionKind {
    Stream(Arc<StreamSession>),
    Datagram(Arc<MessageSession>),
    Raw(Arc<MessageSession>),
    Primary(Arc<PrimarySession>),
}

impl SessionKind {
    pub fn style(&self) -> Style {
        match self {
            SessionKind::Stream(_) => Style::Stream,
            SessionKind::Datagram(_) => Style::Datagram,
            SessionKind::Raw(_) => Style::Raw,
            SessionKind::Primary(_) => Style::Primary,
        }
    }

    pub fn as_stream(&self) -> Option<&Arc<StreamSession>> {
        match self {
            SessionKind::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Arc<MessageSession>> {
        match self {
            SessionKind::Datagram(s) | SessionKind::Raw(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_primary(&self) -> Option<&Arc<PrimarySession>> {
        match self {
            SessionKind::Primary(s) => Some(s),
            _ => None,
        }
    }

    /// Releases the transport binding, if this session owns one.
    pub async fn close(&self) {
        match self {
            SessionKind::Stream(s) => s.close().await,
            SessionKind::Datagram(s) | SessionKind::Raw(s) => s.close().await,
            SessionKind::Primary(s) => s.close().await,
        }
    }
}

/// The client connection a session reports to.
#[derive(Clone)]
pub struct Owner {
    pub conn_id: u64,
    pub writer: ClientWriter,
    /// Ends the owning connection's command loop.
    pub kill: Option<broadcast::Sender<()>>,
}

impl Owner {
    /// Reports a lost transport binding and ends the owning connection, which
    /// in turn tears the session down.
    pub async fn transport_lost(&self, nickname: &str) {
        warn!("Session '{nickname}' lost its transport binding.");
        let reply = Reply::new("SESSION STATUS")
            .result(ResultCode::I2pError)
            .field("MESSAGE", "transport disconnected");
        let _ = self.writer.send(reply).await;
        if let Some(kill) = &self.kill {
            let _ = kill.send(());
        }
    }
}
