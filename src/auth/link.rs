//! Account linking URL
//!
//! The browser-facing page that starts authorization. The dashboard sends the
//! browser back to `redirect` with `?code=<authorization-code>` appended.

use url::Url;
use crate::Result;
use crate::config::Config;

/// Query parameter carrying the local callback address
pub const REDIRECT_PARAM: &str = "redirect";

/// Redirect target for a callback listener bound to `port`
pub fn redirect_base(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// Build the linking URL with `redirect` set to `redirect_base`
pub fn build_linking_url(config: &Config, redirect_base: &str) -> Result<Url> {
    let mut url = config.account_linking_url()?;

    // Replace rather than append so a base URL that already names a redirect
    // cannot send the code elsewhere.
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != REDIRECT_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(REDIRECT_PARAM, redirect_base);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn config_with_web(base: &str) -> Config {
        Config {
            web_base_url: base.to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_linking_url() {
        let url = build_linking_url(&config_with_web("https://example.test"), &redirect_base(41234)).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/dash/link?redirect=http%3A%2F%2Flocalhost%3A41234"
        );
    }

    #[test]
    fn test_redirect_round_trips_through_query() {
        let url = build_linking_url(&config_with_web("http://localhost:3000"), "http://localhost:5555").unwrap();
        let redirect = url
            .query_pairs()
            .find(|(key, _)| key == REDIRECT_PARAM)
            .map(|(_, value)| value.into_owned());
        assert_eq!(redirect.as_deref(), Some("http://localhost:5555"));
    }

    #[test]
    fn test_existing_redirect_is_replaced() {
        let url = build_linking_url(
            &config_with_web("https://example.test/?redirect=https://evil.test&ref=cli"),
            "http://localhost:1",
        )
        .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("ref".to_string(), "cli".to_string()),
                ("redirect".to_string(), "http://localhost:1".to_string()),
            ]
        );
    }

    #[test]
    fn test_malformed_base() {
        let err = build_linking_url(&config_with_web("::::"), "http://localhost:1").unwrap_err();
        assert!(matches!(err, Error::Url { .. }));
    }
}
