//! Authoritative tally snapshots over the vMix HTTP API.

use std::future::Future;
use std::time::Duration;

use log::debug;

use crate::http::HttpClient;

use super::state::TallyState;
use super::xml::parse_state;
use super::TallyError;

/// Source of full tally snapshots.
///
/// The bridge only depends on this trait, so a simulator or a recorded
/// fixture can stand in for a live mixer.
pub trait StateFetcher: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = Result<TallyState, TallyError>> + Send;
}

/// Fetches `<host>:<port><path>` and parses the XML document.
#[derive(Clone)]
pub struct VmixHttpFetcher {
    client: HttpClient,
    url: String,
    timeout: Duration,
}

impl VmixHttpFetcher {
    /// Timeouts above one second are capped; tally must stay snappy.
    pub fn new(host: &str, port: u16, path: &str, timeout: Duration) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        Self {
            client: HttpClient::new(),
            url: format!("http://{}:{}{}", host, port, path),
            timeout: timeout.min(Duration::from_secs(1)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl StateFetcher for VmixHttpFetcher {
    async fn fetch(&self) -> Result<TallyState, TallyError> {
        let response = self.client.get(&self.url, self.timeout).await?;
        let state = parse_state(&response.text())?;
        debug!(
            "[Tally] Fetched PGM={} PVW={} ({} inputs)",
            state.program,
            state.preview,
            state.inputs.len()
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_server;

    #[test]
    fn test_url_and_timeout_cap() {
        let fetcher = VmixHttpFetcher::new("192.168.0.10", 8088, "api", Duration::from_secs(3));
        assert_eq!(fetcher.url(), "http://192.168.0.10:8088/api");
        assert_eq!(fetcher.timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fetch_parses_response() {
        let xml = r#"<vmix><inputs><input number="1" title="Wide" type="Capture"/></inputs><active>1</active><preview>2</preview></vmix>"#;
        let (port, mut requests) = test_server::serve("200 OK", xml.to_string()).await;

        let fetcher = VmixHttpFetcher::new("127.0.0.1", port, "/api", Duration::from_millis(900));
        let state = fetcher.fetch().await.unwrap();

        assert_eq!(state.buses(), (1, 2));
        assert_eq!(state.inputs[&1].name, "Wide");
        assert!(requests.recv().await.unwrap().starts_with("GET /api "));
    }

    #[tokio::test]
    async fn test_fetch_reports_http_and_parse_errors() {
        let (port, _r) = test_server::serve("500 Internal Server Error", String::new()).await;
        let fetcher = VmixHttpFetcher::new("127.0.0.1", port, "/api", Duration::from_millis(900));
        assert!(matches!(fetcher.fetch().await, Err(TallyError::Http(_))));

        let (port, _r) = test_server::serve("200 OK", "<html>".to_string()).await;
        let fetcher = VmixHttpFetcher::new("127.0.0.1", port, "/api", Duration::from_millis(900));
        assert!(matches!(fetcher.fetch().await, Err(TallyError::Parse(_))));
    }
}
