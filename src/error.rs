//! Subscription error taxonomy.

use crate::protocol::{join_messages, GraphqlError};

/// Errors surfaced by the subscription engine.
///
/// Transport-level failures always accompany a terminal connection-state
/// transition and consume reconnect budget; GraphQL-level errors arrive
/// over a healthy channel, leave the connection state untouched, and
/// consume nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The underlying socket or stream could not be opened or failed.
    #[error("{0}")]
    Transport(String),

    /// Server-sent GraphQL errors, pre-joined into one message.
    #[error("{message}")]
    Graphql {
        /// All error messages joined with `", "`.
        message: String,
    },

    /// The configured endpoint could not be turned into a transport URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A frame or event body failed to decode.
    #[error("malformed message: {0}")]
    Decode(String),
}

impl SubscriptionError {
    /// Build a [`SubscriptionError::Graphql`] from a server error list.
    #[must_use]
    pub fn graphql(errors: &[GraphqlError]) -> Self {
        Self::Graphql {
            message: join_messages(errors),
        }
    }

    /// Returns `true` for failures of the physical connection itself.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::InvalidEndpoint(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphql_error_displays_joined_messages() {
        let errors = vec![
            GraphqlError::new("Permission denied"),
            GraphqlError::new("field missing"),
        ];
        let err = SubscriptionError::graphql(&errors);
        assert_eq!(err.to_string(), "Permission denied, field missing");
        assert!(!err.is_transport());
    }

    #[test]
    fn transport_error_displays_bare_message() {
        let err = SubscriptionError::Transport("WebSocket connection failed".into());
        assert_eq!(err.to_string(), "WebSocket connection failed");
        assert!(err.is_transport());
    }
}
