use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

/// WebSocket close codes used by the gateway.
pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const BAD_PARAMETERS: u16 = 4003;
    pub const INIT_FAILURE: u16 = 4005;
    pub const UPSTREAM_CLOSED: u16 = 4010;
    pub const UPSTREAM_ERROR: u16 = 4011;
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad parameter: {0}")]
    BadParam(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("peer closed")]
    PeerClosed,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("channel ids exhausted")]
    CapacityExhausted,
}

impl GatewayError {
    pub fn close_code(&self) -> u16 {
        match self {
            GatewayError::BadParam(_) | GatewayError::ProtocolViolation(_) => {
                close::BAD_PARAMETERS
            }
            GatewayError::Timeout(_) => close::UPSTREAM_CLOSED,
            GatewayError::Upstream(_) => close::UPSTREAM_ERROR,
            GatewayError::CapacityExhausted => close::INIT_FAILURE,
            GatewayError::PeerClosed => close::NORMAL,
            _ => close::INIT_FAILURE,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadParam(_)
            | GatewayError::InvalidState(_)
            | GatewayError::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::PeerClosed => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<pier_proto::WireError> for GatewayError {
    fn from(err: pier_proto::WireError) -> Self {
        GatewayError::ProtocolViolation(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({ "success": false, "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::timeout]
    fn close_codes_match_wire_contract() {
        assert_eq!(GatewayError::BadParam("x".into()).close_code(), 4003);
        assert_eq!(GatewayError::Upstream("gone".into()).close_code(), 4011);
        assert_eq!(GatewayError::Timeout("slow".into()).close_code(), 4010);
        assert_eq!(GatewayError::CapacityExhausted.close_code(), 4005);
        assert_eq!(GatewayError::PeerClosed.close_code(), 1000);
    }

    #[test_deadline::timeout]
    fn http_statuses() {
        assert_eq!(
            GatewayError::NotFound("session".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::InvalidState("pause while stopped").status(),
            StatusCode::BAD_REQUEST
        );
    }
}
