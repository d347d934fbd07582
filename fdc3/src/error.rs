use std::{convert::Infallible, error, fmt};

/// The error type for `fdc3`.
///
/// The various errors that can be reported by this crate. The FDC3 standard
/// identifies most failures by a well-known string (`ResolveError`,
/// `ChannelError`, `OpenError` and `AgentError` namespaces); those variants
/// round-trip losslessly through the `payload.error` field of response
/// messages via [`Error::wire_code`] and [`Error::from_wire_code`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No app matched the raised intent (`ResolveError.NoAppsFound`).
    NoAppsFound,
    /// The resolver did not produce a choice in time (`ResolveError.ResolverTimeout`).
    ResolverTimeout,
    /// The user dismissed the resolver (`ResolveError.UserCancelled`).
    UserCancelled,
    /// The targeted app is not known to the directory (`ResolveError.TargetAppUnavailable`).
    TargetAppUnavailable,
    /// The targeted instance is not live (`ResolveError.TargetInstanceUnavailable`).
    TargetInstanceUnavailable,
    /// The supplied context is not an object with a string `type`
    /// (`ResolveError.MalformedContext` / `ChannelError.MalformedContext`).
    MalformedContext,
    /// The channel id does not name a known user channel (`ChannelError.NoChannelFound`).
    NoChannelFound,
    /// The caller is not on the private channel's allowed list
    /// (`ChannelError.AccessDenied`).
    AccessDenied,
    /// The app id is not present in the directory catalog (`OpenError.AppNotFound`).
    AppNotFound,
    /// No root agent answered the connection attempt (`AgentError.AgentNotFound`).
    AgentNotFound,
    /// A failover handler produced a window reference, which this
    /// implementation cannot adopt as an agent.
    FailoverWindowNotSupported,
    /// A request did not receive its response within the configured timeout.
    ApiTimeout,
    /// The transport to the peer is gone.
    Disconnected,
    /// Unexpected or malformed wire traffic.
    Protocol(String),
    /// An error string from a response payload that is not one of the FDC3
    /// identifiers.
    Agent(String),
}

impl Error {
    /// The FDC3 string identifier carried in `payload.error` on the wire.
    pub fn wire_code(&self) -> &str {
        match self {
            Error::NoAppsFound => "NoAppsFound",
            Error::ResolverTimeout => "ResolverTimeout",
            Error::UserCancelled => "UserCancelled",
            Error::TargetAppUnavailable => "TargetAppUnavailable",
            Error::TargetInstanceUnavailable => "TargetInstanceUnavailable",
            Error::MalformedContext => "MalformedContext",
            Error::NoChannelFound => "NoChannelFound",
            Error::AccessDenied => "AccessDenied",
            Error::AppNotFound => "AppNotFound",
            Error::AgentNotFound => "AgentNotFound",
            Error::FailoverWindowNotSupported => {
                "Failover Window result not currently supported"
            }
            Error::ApiTimeout => "ApiTimeout",
            Error::Disconnected => "Disconnected",
            Error::Protocol(_) => "ProtocolError",
            Error::Agent(s) => s,
        }
    }

    /// Maps a `payload.error` string back to the matching variant.
    ///
    /// Unknown strings are preserved verbatim in [`Error::Agent`] so a newer
    /// peer's error identifiers survive the round trip.
    pub fn from_wire_code(code: &str) -> Self {
        match code {
            "NoAppsFound" => Error::NoAppsFound,
            "ResolverTimeout" => Error::ResolverTimeout,
            "UserCancelled" => Error::UserCancelled,
            "TargetAppUnavailable" => Error::TargetAppUnavailable,
            "TargetInstanceUnavailable" => Error::TargetInstanceUnavailable,
            "MalformedContext" => Error::MalformedContext,
            "NoChannelFound" => Error::NoChannelFound,
            "AccessDenied" => Error::AccessDenied,
            "AppNotFound" => Error::AppNotFound,
            "AgentNotFound" => Error::AgentNotFound,
            "Failover Window result not currently supported" => {
                Error::FailoverWindowNotSupported
            }
            "ApiTimeout" => Error::ApiTimeout,
            "Disconnected" => Error::Disconnected,
            other => Error::Agent(other.to_string()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(detail) => write!(f, "protocol error: {detail}"),
            Error::Agent(code) => write!(f, "{code}"),
            other => write!(f, "{}", other.wire_code()),
        }
    }
}

impl error::Error for Error {}

impl From<Infallible> for Error {
    fn from(i: Infallible) -> Self {
        match i {}
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Alias for a `Result` with the error type [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        let kinds = [
            Error::NoAppsFound,
            Error::ResolverTimeout,
            Error::UserCancelled,
            Error::TargetAppUnavailable,
            Error::TargetInstanceUnavailable,
            Error::MalformedContext,
            Error::NoChannelFound,
            Error::AccessDenied,
            Error::AppNotFound,
            Error::AgentNotFound,
            Error::FailoverWindowNotSupported,
        ];
        for kind in kinds {
            assert_eq!(Error::from_wire_code(kind.wire_code()), kind);
        }
    }

    #[test]
    fn unknown_code_is_preserved() {
        let err = Error::from_wire_code("IntentDeliveryFailed");
        assert_eq!(err, Error::Agent("IntentDeliveryFailed".to_string()));
        assert_eq!(err.wire_code(), "IntentDeliveryFailed");
    }

    #[test]
    fn failover_window_display_is_the_wire_literal() {
        assert_eq!(
            Error::FailoverWindowNotSupported.to_string(),
            "Failover Window result not currently supported"
        );
    }
}
