// src/core/handler/actions/dest.rs

use crate::core::handler::command_router::RouteResponse;
use crate::core::protocol::{CommandLine, Props, Reply};
use crate::core::state::GatewayState;
use crate::core::SamError;
use crate::transport::SignatureType;
use std::sync::Arc;

/// Reads `SIGNATURE_TYPE`, by code or name. Missing means the transport default.
pub fn signature_type(props: &Props) -> Result<SignatureType, SamError> {
    match props.get("SIGNATURE_TYPE") {
        None => Ok(SignatureType::default()),
        Some(raw) => SignatureType::parse(raw).ok_or_else(|| SamError::InvalidValue {
            key: "SIGNATURE_TYPE",
            value: raw.to_string(),
        }),
    }
}

/// Handles `DEST GENERATE`. The registry is not touched.
pub async fn generate(state: &Arc<GatewayState>, line: &CommandLine) -> Result<RouteResponse, SamError> {
    let sig = signature_type(&line.props)?;
    let keys = state.transport.generate_keys(sig).await?;
    Ok(RouteResponse::Reply(
        Reply::new("DEST REPLY")
            .field("PUB", keys.public)
            .field("PRIV", keys.private),
    ))
}
