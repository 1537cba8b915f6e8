use thiserror::Error;

/// Errors surfaced synchronously by `MessageRouter::route` and router setup.
/// Everything that happens after a message is accepted is reported through
/// message-processed listeners instead.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Message {message_id} expired at {expiry_ms}")]
    MessageExpired { message_id: String, expiry_ms: i64 },

    #[error("Message {message_id} carries a relative TTL")]
    RelativeTtl { message_id: String },

    #[error("Router is shutting down")]
    ShutdownInProgress,

    #[error("Access control is enabled but no access controller was provided")]
    MissingAccessController,

    #[error("Configuration error: {0}")]
    Config(#[from] rp_config::ConfigError),
}
