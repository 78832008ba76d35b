use axum::http::StatusCode;
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::migrate::MigrateError;
use crate::newznab::client::ClientError;
use crate::newznab::wire::{ErrorEnvelope, WireError, XML_HEADER};

/// Unified application error.
///
/// Fatal kinds (`Config`, `Migration`) abort startup; everything else is
/// captured at the request boundary and rendered as a Newznab in-band error:
/// HTTP 200 with an `<error code=".." description=".."/>` body, which is how
/// Newznab clients expect protocol failures to arrive.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Migration(#[from] MigrateError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("upstream error from {backend}: {source}")]
    Upstream {
        backend: String,
        source: ClientError,
    },

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("no NZB found with id {0}")]
    NzbNotFound(String),

    #[error("the indexer that provided this NZB is no longer configured: {0}")]
    OrphanIndexer(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("method {0} not implemented")]
    NotImplemented(String),
}

impl ProxyError {
    /// Code carried inside the in-band error envelope. The transport status
    /// is always 200.
    fn protocol_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::NzbNotFound(_) | Self::OrphanIndexer(_) => 400,
            Self::Unauthorized => 401,
            Self::NotImplemented(_) => 501,
            Self::Config(_)
            | Self::Migration(_)
            | Self::Storage(_)
            | Self::Upstream { .. }
            | Self::Wire(_) => 500,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Storage(_) | Self::Upstream { .. } | Self::Wire(_)) {
            tracing::error!(error = %self, "Request failed");
        }
        let envelope = ErrorEnvelope {
            code: self.protocol_code(),
            description: self.to_string(),
        };
        let body = envelope
            .to_xml()
            .unwrap_or_else(|_| format!("{XML_HEADER}<error code=\"500\" description=\"internal error\"/>"));
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/xml")],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_description_matches_protocol() {
        let err = ProxyError::NzbNotFound("abc123".to_string());
        assert_eq!(err.to_string(), "no NZB found with id abc123");
        assert_eq!(err.protocol_code(), 400);
    }

    #[test]
    fn test_orphan_indexer_description() {
        let err = ProxyError::OrphanIndexer("alpha".to_string());
        assert_eq!(
            err.to_string(),
            "the indexer that provided this NZB is no longer configured: alpha"
        );
        assert_eq!(err.protocol_code(), 400);
    }

    #[test]
    fn test_protocol_codes() {
        assert_eq!(ProxyError::Unauthorized.protocol_code(), 401);
        assert_eq!(
            ProxyError::NotImplemented("caps".to_string()).protocol_code(),
            501
        );
        assert_eq!(
            ProxyError::Config("bad yaml".to_string()).protocol_code(),
            500
        );
    }
}
