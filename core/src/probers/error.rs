// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Probe error types.
//!
//! Probe errors never cross into API responses; they shape the next sample
//! fed to the status engine. The classification predicates drive logging
//! policy (auth failures are rate-limited) and error tagging on failed
//! samples.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while probing a device.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe deadline elapsed before a response arrived.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure: refused, reset, unreachable, DNS.
    #[error("Network error: {0}")]
    Network(String),

    /// The device rejected the configured credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The device answered with something we could not parse.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The credential bag is missing a required key or holds a bad value.
    #[error("Invalid credentials: {0}")]
    Credentials(String),

    /// The device kind has no prober (placeholders) or the operation is not
    /// available for this transport.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ProbeError {
    /// Transient errors count toward the offline threshold but are not
    /// individually logged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }

    /// Auth failures are logged at most once per device per hour.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Credentials(_))
    }

    /// Short stable tag recorded on failed samples.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Auth(_) => "auth",
            Self::Protocol(_) => "protocol",
            Self::Credentials(_) => "credentials",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(Duration::ZERO)
            }
            _ => Self::Network(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_connect() {
            Self::Network(err.to_string())
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProbeError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(ProbeError::Network("reset".to_string()).is_transient());
        assert!(!ProbeError::Auth("denied".to_string()).is_transient());

        assert!(ProbeError::Auth("denied".to_string()).is_auth());
        assert!(ProbeError::Credentials("missing username".to_string()).is_auth());
        assert!(!ProbeError::Protocol("garbage".to_string()).is_auth());
    }

    #[test]
    fn test_tags() {
        assert_eq!(ProbeError::Timeout(Duration::ZERO).tag(), "timeout");
        assert_eq!(ProbeError::Protocol("x".to_string()).tag(), "protocol");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: ProbeError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, ProbeError::Network(_)));

        let err: ProbeError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, ProbeError::Timeout(_)));
    }
}
