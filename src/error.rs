//! Error types and handling for the OpenVPN protocol engine

use thiserror::Error;

/// Main error type for session operations
#[derive(Error, Debug)]
pub enum VpnError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or truncated packets, unknown opcodes
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Control channel framing errors
    #[error("Control channel error: {0}")]
    ControlChannel(String),

    /// Auth reply does not start with the key-method 2 prefix
    #[error("Wrong control data prefix")]
    WrongControlDataPrefix,

    /// Remote session id does not match the expected one
    #[error("Session mismatch")]
    SessionMismatch,

    /// A packet arrived before a session id was known
    #[error("Missing session id")]
    MissingSessionId,

    /// Negotiation did not complete in time
    #[error("Negotiation timed out")]
    NegotiationTimeout,

    /// The server has been silent beyond the keepalive timeout
    #[error("Ping timed out")]
    PingTimeout,

    /// The server rejected the credentials
    #[error("Authentication failed")]
    BadCredentials,

    /// The server rejected the credentials sent along with local options
    #[error("Authentication failed (with local options)")]
    BadCredentialsWithLocalOptions,

    /// The server sent RESTART
    #[error("Server shutdown")]
    ServerShutdown,

    /// The server requires an unsupported compression scheme
    #[error("Server requires unsupported compression")]
    ServerCompression,

    /// The PUSH_REPLY carries neither IPv4 nor IPv6 settings
    #[error("No routing information pushed")]
    NoRouting,

    /// HARD_RESET_SERVER received on an established session
    #[error("Stale session")]
    StaleSession,

    /// A PUSH_REPLY fragment that must be joined with the next one
    #[error("PUSH_REPLY continuation")]
    ContinuationPushReply,

    /// PUSH_REPLY could not be parsed
    #[error("Malformed option: {0}")]
    MalformedOption(String),

    /// Cryptographic errors
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// Link or tunnel I/O failures
    #[error("Link error: {0}")]
    Link(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Logic errors that correct operation never produces
    #[error("Assertion failed: {0}")]
    Assertion(String),

    /// Errors eligible for an outer reconnect
    #[error("Recoverable: {0}")]
    Recoverable(Box<VpnError>),
}

impl VpnError {
    /// Wrap an error so the caller may reconnect after it
    pub fn recoverable(err: VpnError) -> Self {
        match err {
            VpnError::Recoverable(_) => err,
            other => VpnError::Recoverable(Box::new(other)),
        }
    }

    /// Whether an outer layer should attempt to reconnect
    pub fn is_recoverable(&self) -> bool {
        matches!(self, VpnError::Recoverable(_))
    }

    /// The error with any recoverable wrapping removed
    pub fn root(&self) -> &VpnError {
        match self {
            VpnError::Recoverable(inner) => inner.root(),
            other => other,
        }
    }

    /// Errors that still allow the exit notification to be sent
    pub(crate) fn allows_exit_notify(&self) -> bool {
        !matches!(
            self.root(),
            VpnError::SessionMismatch
                | VpnError::MissingSessionId
                | VpnError::StaleSession
                | VpnError::PingTimeout
                | VpnError::Assertion(_)
                | VpnError::Link(_)
                | VpnError::Io(_)
        )
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, VpnError>;

/// Helper trait for converting errors to VpnError
pub trait IntoVpnError<T> {
    fn into_vpn_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoVpnError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_vpn_error(self, context: &str) -> Result<T> {
        self.map_err(|e| VpnError::Protocol(format!("{context}: {e}")))
    }
}

// Implement From for common error types
impl From<toml::de::Error> for VpnError {
    fn from(err: toml::de::Error) -> Self {
        VpnError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<rustls::Error> for VpnError {
    fn from(err: rustls::Error) -> Self {
        VpnError::Tls(err.to_string())
    }
}

impl From<ring::error::Unspecified> for VpnError {
    fn from(_: ring::error::Unspecified) -> Self {
        VpnError::Crypto("operation failed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VpnError::Config("test config error".to_string());
        assert_eq!(err.to_string(), "Configuration error: test config error");
        assert_eq!(VpnError::SessionMismatch.to_string(), "Session mismatch");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let vpn_err: VpnError = io_err.into();
        assert!(matches!(vpn_err, VpnError::Io(_)));
    }

    #[test]
    fn test_recoverable_wrapping() {
        let err = VpnError::recoverable(VpnError::NegotiationTimeout);
        assert!(err.is_recoverable());
        assert!(matches!(err.root(), VpnError::NegotiationTimeout));

        let twice = VpnError::recoverable(err);
        assert!(matches!(twice, VpnError::Recoverable(ref inner) if !inner.is_recoverable()));
        assert!(!VpnError::PingTimeout.is_recoverable());
    }

    #[test]
    fn test_exit_notify_policy() {
        assert!(VpnError::ServerShutdown.allows_exit_notify());
        assert!(VpnError::recoverable(VpnError::NegotiationTimeout).allows_exit_notify());
        assert!(!VpnError::PingTimeout.allows_exit_notify());
        assert!(!VpnError::SessionMismatch.allows_exit_notify());
    }

    #[test]
    fn test_into_vpn_error_trait() {
        let result: std::result::Result<(), &str> = Err("test error");
        let vpn_result = result.into_vpn_error("test context");
        assert!(vpn_result.is_err());
        assert!(vpn_result.unwrap_err().to_string().contains("test context"));
    }
}
