//! Error types for cloudlink

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cloudlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while signing in or reading the session store
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL {url:?}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Failed to start callback listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Callback listener error: {0}")]
    Callback(String),

    #[error("Request token")]
    Network(#[from] reqwest::Error),

    #[error("Request token: unexpected status {0}")]
    ExchangeStatus(reqwest::StatusCode),

    #[error("Decode token response")]
    Decode(#[source] serde_json::Error),

    #[error("{action} {path:?}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encode session store")]
    Encode(#[source] serde_yaml::Error),

    #[error("Decode session store {path:?}")]
    StoreDecode {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Sign in timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Sign in cancelled")]
    Cancelled,

    #[error("No current session")]
    NoCurrentSession,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_cause_printed_once_in_chain() {
        let err = Error::Bind {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "Address already in use"),
        };
        let chain = format!("{:#}", anyhow::Error::new(err).context("sign into cloud"));
        assert_eq!(
            chain,
            "sign into cloud: Failed to start callback listener on 127.0.0.1:1: Address already in use"
        );
    }

    #[test]
    fn test_store_errors_keep_their_source() {
        let err = Error::Io {
            action: "Read session store",
            path: PathBuf::from("/tmp/auth.yaml"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "Permission denied"),
        };
        assert_eq!(err.to_string(), "Read session store \"/tmp/auth.yaml\"");
        assert_eq!(
            std::error::Error::source(&err).map(|source| source.to_string()).as_deref(),
            Some("Permission denied")
        );
        assert_eq!(
            format!("{:#}", anyhow::Error::new(err)),
            "Read session store \"/tmp/auth.yaml\": Permission denied"
        );
    }
}
