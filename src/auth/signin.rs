//! Browser-mediated sign in
//!
//! Starts the callback server, prints the linking URL, then waits for
//! whichever comes first: the caller cancelling, the sign-in deadline, or the
//! browser callback. A received code is exchanged for a session, which is
//! recorded in the session store. The store is only written after a
//! successful exchange, and the callback server is always stopped before
//! [`SignIn::run`] returns.

use std::io::Write;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;
use crate::Result;
use crate::config::Config;
use crate::error::Error;
use super::callback_server::CallbackServer;
use super::link::{build_linking_url, redirect_base};
use super::session::{Session, SessionStore};
use super::token::{CloudClient, TokenExchange};

/// Printed above the linking URL
pub const SIGNIN_MESSAGE: &str = "Visit this URL on this device to log in:";

/// One sign-in against the cloud
pub struct SignIn<E = CloudClient> {
    config: Config,
    store: SessionStore,
    exchange: E,
    open_browser: bool,
}

impl SignIn<CloudClient> {
    /// Sign in against the endpoints in `config`
    pub fn new(config: Config) -> Result<Self> {
        let exchange = CloudClient::new(&config)?;
        Ok(Self::with_exchange(config, exchange))
    }
}

impl<E: TokenExchange> SignIn<E> {
    /// Sign in using a custom token exchange
    pub fn with_exchange(config: Config, exchange: E) -> Self {
        let store = SessionStore::new(config.store_path.clone());
        Self {
            config,
            store,
            exchange,
            open_browser: false,
        }
    }

    /// Also try to open the linking URL in the default browser
    pub fn open_browser(mut self, open_browser: bool) -> Self {
        self.open_browser = open_browser;
        self
    }

    /// Run the sign-in flow, writing instructions to `output`
    ///
    /// Returns the new session, which is also the store's current session.
    pub async fn run<W: Write + ?Sized>(&self, cancel: &CancellationToken, output: &mut W) -> Result<Session> {
        let mut server = CallbackServer::start(self.config.signin_port, cancel).await?;
        // the deadline runs from the moment the listener is up
        let deadline = Instant::now() + self.config.signin_timeout;
        let result = self.authenticate(&mut server, deadline, cancel, output).await;
        server.shutdown().await;

        if let Err(e) = &result {
            tracing::debug!("Sign in failed: {:?}", e);
        }
        result
    }

    async fn authenticate<W: Write + ?Sized>(
        &self,
        server: &mut CallbackServer,
        deadline: Instant,
        cancel: &CancellationToken,
        output: &mut W,
    ) -> Result<Session> {
        tracing::debug!("Sign in listening on port {}", server.port());

        let linking_url = build_linking_url(&self.config, &redirect_base(server.port()))?;
        if let Err(e) = print_instructions(output, &linking_url) {
            tracing::warn!("Failed to print sign in instructions: {}", e);
        }

        if self.open_browser {
            // opening a browser can block, keep it off the runtime
            let linking_url = linking_url.to_string();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = open::that(&linking_url) {
                    tracing::warn!("Failed to open browser: {}", e);
                }
            });
        }

        let code = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            code = server.code() => code.map_err(|_| {
                Error::Callback("server stopped before receiving an authorization code".to_string())
            })?,
            _ = tokio::time::sleep_until(deadline) => return Err(Error::Timeout(self.config.signin_timeout)),
        };

        tracing::debug!("Authorization code received, exchanging for a token");

        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            session = self.exchange.exchange(&code) => session?,
        };

        let mut store = self.store.load()?;
        store.record(session.clone());
        self.store.save(&store)?;

        tracing::info!("Successful sign in");
        Ok(session)
    }
}

fn print_instructions<W: Write + ?Sized>(output: &mut W, linking_url: &Url) -> std::io::Result<()> {
    writeln!(output, "{}", SIGNIN_MESSAGE)?;
    write!(output, "\n     {}\n\n", linking_url)?;
    output.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;
    use tokio_test::assert_err;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use crate::auth::session::Store;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config(dir: &tempfile::TempDir, api_base_url: &str) -> Config {
        Config {
            api_base_url: api_base_url.to_string(),
            web_base_url: "https://example.test".to_string(),
            signin_port: Some(free_port()),
            store_path: dir.path().join("cloud").join("auth.yaml"),
            signin_timeout: Duration::from_secs(10),
        }
    }

    /// Hit the callback server until it answers
    async fn send_callback(port: u16, code: &str) -> reqwest::Response {
        let url = format!("http://127.0.0.1:{}/?code={}", port, code);
        for _ in 0..100 {
            if let Ok(response) = reqwest::get(&url).await {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("callback server on port {} never came up", port);
    }

    async fn token_server(status: u16, user_id: &str, token: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tokenRequest"))
            .and(query_param("code", "CODE42"))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({
                "userId": user_id,
                "token": token
            })))
            .mount(&server)
            .await;
        server
    }

    /// Never finishes an exchange
    struct PendingExchange;

    #[async_trait]
    impl TokenExchange for PendingExchange {
        async fn exchange(&self, _code: &str) -> Result<Session> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_sign_in_appends_new_user() {
        let dir = tempfile::tempdir().unwrap();
        let api = token_server(200, "u2", "t2").await;
        let config = test_config(&dir, &api.uri());
        let port = config.signin_port.unwrap();

        let t0 = Utc::now() - ChronoDuration::hours(1);
        let existing = Store {
            current: "u1".to_string(),
            sessions: vec![Session {
                user_id: "u1".to_string(),
                token: "t1".to_string(),
                created_at: t0,
            }],
        };
        SessionStore::new(&config.store_path).save(&existing).unwrap();

        let signin = SignIn::new(config.clone()).unwrap();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(async move {
            let mut output = Vec::new();
            let result = signin.run(&cancel, &mut output).await;
            (result, output)
        });

        let response = send_callback(port, "CODE42").await;
        assert_eq!(response.status(), 200);

        let (result, output) = run.await.unwrap();
        let session = result.unwrap();
        assert_eq!(session.user_id, "u2");
        assert_eq!(session.token, "t2");

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with(SIGNIN_MESSAGE));
        assert!(output.contains(&format!(
            "https://example.test/dash/link?redirect=http%3A%2F%2Flocalhost%3A{}",
            port
        )));

        let store = SessionStore::new(&config.store_path).load().unwrap();
        assert_eq!(store.current, "u2");
        assert_eq!(store.sessions.len(), 2);
        assert_eq!(store.sessions[0], existing.sessions[0]);
        assert_eq!(store.sessions[1].user_id, "u2");
        assert_eq!(store.sessions[1].token, "t2");
        assert!(store.sessions[1].created_at > t0);
        assert_eq!(store.current_session().unwrap().token, "t2");
    }

    #[tokio::test]
    async fn test_exchange_failure_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let api = token_server(503, "u2", "t2").await;
        let config = test_config(&dir, &api.uri());
        let port = config.signin_port.unwrap();

        let mut existing = Store::default();
        existing.record(Session::new("u1".to_string(), "t1".to_string()));
        let sessions = SessionStore::new(&config.store_path);
        sessions.save(&existing).unwrap();
        let before = std::fs::read(sessions.path()).unwrap();

        let signin = SignIn::new(config).unwrap();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(async move { signin.run(&cancel, &mut std::io::sink()).await });

        send_callback(port, "CODE42").await;

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ExchangeStatus(status) if status.as_u16() == 503));
        assert_eq!(std::fs::read(sessions.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "http://127.0.0.1:9");
        let store_path = config.store_path.clone();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut output = Vec::new();
        let result = SignIn::new(config).unwrap().run(&cancel, &mut output).await;

        assert!(matches!(assert_err!(result), Error::Cancelled));
        assert!(!store_path.exists());
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, "http://127.0.0.1:9");
        config.signin_timeout = Duration::from_millis(200);
        let store_path = config.store_path.clone();
        let port = config.signin_port.unwrap();

        let cancel = CancellationToken::new();
        let mut output = Vec::new();
        let result = SignIn::new(config).unwrap().run(&cancel, &mut output).await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(!store_path.exists());
        // instructions were printed before waiting
        assert!(String::from_utf8(output).unwrap().contains("/dash/link?redirect="));
        // and the listener is gone
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    /// Output that takes longer to flush than the sign-in timeout
    struct SlowOutput;

    impl Write for SlowOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_deadline_starts_when_listening() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, "http://127.0.0.1:9");
        config.signin_timeout = Duration::from_millis(400);

        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let result = SignIn::new(config).unwrap().run(&cancel, &mut SlowOutput).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(Error::Timeout(timeout)) if timeout == Duration::from_millis(400)));
        // the flush already used up the whole budget
        assert!(elapsed < Duration::from_millis(800), "sign in took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_cancel_during_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "http://127.0.0.1:9");
        let store_path = config.store_path.clone();
        let port = config.signin_port.unwrap();

        let signin = SignIn::with_exchange(config, PendingExchange);
        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { signin.run(&cancel, &mut std::io::sink()).await })
        };

        send_callback(port, "CODE42").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!store_path.exists());
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(&dir, "http://127.0.0.1:9");
        config.signin_port = Some(occupied.local_addr().unwrap().port());

        let cancel = CancellationToken::new();
        let result = SignIn::new(config).unwrap().run(&cancel, &mut std::io::sink()).await;
        assert!(matches!(result, Err(Error::Bind { .. })));
    }
}
