//! Token exchange
//!
//! Trades the authorization code from the browser redirect for a session
//! credential: `POST <api>/tokenRequest?code=<code>` with no body, answered by
//! `200 OK` and `{"userId": ..., "token": ...}`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;
use crate::Result;
use crate::config::Config;
use crate::error::Error;
use super::session::Session;

/// Token request endpoint on the cloud API
const TOKEN_REQUEST_ENDPOINT: &str = "tokenRequest";

/// Query parameter carrying the authorization code
const TOKEN_REQUEST_CODE_PARAM: &str = "code";

/// Exchanges an authorization code for a session
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, code: &str) -> Result<Session>;
}

/// Token endpoint response body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    user_id: String,
    token: String,
}

/// Client for the cloud API's token endpoint
#[derive(Clone)]
pub struct CloudClient {
    http_client: Client,
    token_url: Url,
}

impl CloudClient {
    /// Fails if the configured API base URL is malformed
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_client(Client::new(), config)
    }

    /// Use an existing `reqwest` client (shared pool, custom timeouts)
    pub fn with_client(http_client: Client, config: &Config) -> Result<Self> {
        Ok(Self {
            http_client,
            token_url: config.api_url(TOKEN_REQUEST_ENDPOINT)?,
        })
    }

    fn token_request_url(&self, code: &str) -> Url {
        let mut url = self.token_url.clone();
        url.query_pairs_mut().append_pair(TOKEN_REQUEST_CODE_PARAM, code);
        url
    }
}

#[async_trait]
impl TokenExchange for CloudClient {
    async fn exchange(&self, code: &str) -> Result<Session> {
        let url = self.token_request_url(code);

        let response = self.http_client.post(url).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::ExchangeStatus(status));
        }

        let body = response.bytes().await?;
        let token_response: TokenResponse = serde_json::from_slice(&body).map_err(Error::Decode)?;

        tracing::debug!("Token issued for user {}", token_response.user_id);

        // createdAt is always local time, whatever the server sends
        Ok(Session::new(token_response.user_id, token_response.token))
    }
}
