//! Configuration management
//!
//! Endpoint and listener settings are resolved once, by [`Config::from_env`],
//! and handed to the sign-in flow explicitly. Nothing below this module reads
//! the process environment.

use std::path::PathBuf;
use std::time::Duration;
use url::{ParseError, Url};
use crate::Result;
use crate::error::Error;

/// Overrides the cloud API base URL (development only)
pub const API_BASE_URL_ENV: &str = "CLOUDLINK_DEV_API_BASE_URL";

/// Overrides the web dashboard base URL (development only)
pub const WEB_BASE_URL_ENV: &str = "CLOUDLINK_DEV_WEB_BASE_URL";

/// Pins the sign-in callback listener to a fixed port (development only)
pub const SIGNIN_PORT_ENV: &str = "CLOUDLINK_DEV_SIGNIN_PORT";

const API_PRODUCTION_BASE_URL: &str = "https://api.cloudlink.dev";
const WEB_PRODUCTION_BASE_URL: &str = "https://cloudlink.dev";
const DASH_BASE_PATH: &str = "dash";
const ACCOUNT_LINKING_PATH: &str = "link";

/// Absolute deadline for the browser callback to arrive
pub const DEFAULT_SIGNIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Settings for one sign-in
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the cloud API (token exchange lives here)
    pub api_base_url: String,

    /// Base URL of the web dashboard (account linking lives here)
    pub web_base_url: String,

    /// Fixed callback port, `None` lets the OS pick one
    pub signin_port: Option<u16>,

    /// Location of the persisted session store
    pub store_path: PathBuf,

    /// How long to wait for the browser callback
    pub signin_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: API_PRODUCTION_BASE_URL.to_string(),
            web_base_url: WEB_PRODUCTION_BASE_URL.to_string(),
            signin_port: None,
            store_path: auth_store_path(),
            signin_timeout: DEFAULT_SIGNIN_TIMEOUT,
        }
    }
}

impl Config {
    /// Production defaults with the development overrides applied
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = var(API_BASE_URL_ENV) {
            tracing::debug!("Using API base URL override: {}", url);
            config.api_base_url = url;
        }

        if let Some(url) = var(WEB_BASE_URL_ENV) {
            tracing::debug!("Using web base URL override: {}", url);
            config.web_base_url = url;
        }

        if let Some(port) = var(SIGNIN_PORT_ENV) {
            let port = port.trim().parse::<u16>().map_err(|e| {
                Error::Config(format!("{} must be a port number, got {:?}: {}", SIGNIN_PORT_ENV, port, e))
            })?;
            config.signin_port = Some(port);
        }

        Ok(config)
    }

    /// URL of an endpoint on the cloud API
    pub fn api_url(&self, endpoint: &str) -> Result<Url> {
        join_path(&self.api_base_url, &[endpoint])
    }

    /// URL of a page on the cloud website
    pub fn web_url(&self, endpoint: &str) -> Result<Url> {
        join_path(&self.web_base_url, &[endpoint])
    }

    /// URL of a page on the web dashboard
    pub fn dash_url(&self, endpoint: &str) -> Result<Url> {
        join_path(&self.web_base_url, &[DASH_BASE_PATH, endpoint])
    }

    /// Dashboard page where a browser user links this CLI to their account
    pub fn account_linking_url(&self) -> Result<Url> {
        self.dash_url(ACCOUNT_LINKING_PATH)
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cloudlink")
}

/// Get the session store path
pub fn auth_store_path() -> PathBuf {
    config_dir().join("cloud").join("auth.yaml")
}

/// Append path segments to `base`, keeping any path the base already has
fn join_path(base: &str, segments: &[&str]) -> Result<Url> {
    let invalid = |source: ParseError| Error::Url {
        url: base.to_string(),
        source,
    };

    let mut joined = Url::parse(base).map_err(invalid)?;
    {
        let mut path = joined
            .path_segments_mut()
            .map_err(|_| invalid(ParseError::RelativeUrlWithCannotBeABaseBase))?;
        path.pop_if_empty();
        for segment in segments {
            path.extend(segment.split('/').filter(|part| !part.is_empty()));
        }
    }

    Ok(joined)
}
