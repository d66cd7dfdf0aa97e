//! Small HTTP client shared by the vMix fetcher and the MediaMTX API client.
//!
//! Wraps a hyper-util legacy client over hyper-rustls so both `http://` and
//! `https://` endpoints work. Every request carries its own timeout; the
//! body is collected in full before returning.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

/// Errors from a single HTTP exchange
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Response with a fully collected body
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    /// Body decoded as UTF-8 (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Cloneable HTTP client (the connection pool is shared between clones)
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        // Create HTTP client with webpki roots for TLS
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(https);
        Self { client }
    }

    /// GET `uri`, failing on non-2xx status.
    pub async fn get(&self, uri: &str, timeout: Duration) -> Result<HttpResponse, HttpError> {
        self.send(Method::GET, uri, Bytes::new(), timeout).await
    }

    /// POST `body` to `uri`, failing on non-2xx status.
    pub async fn post(&self, uri: &str, body: Bytes, timeout: Duration) -> Result<HttpResponse, HttpError> {
        self.send(Method::POST, uri, body, timeout).await
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body))
            .map_err(|e| HttpError::InvalidRequest(format!("{}: {}", uri, e)))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;

            let status = response.status();

            // Read response body
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| HttpError::Transport(format!("Failed to read response body: {}", e)))?
                .to_bytes();

            Ok::<_, HttpError>(HttpResponse { status, body })
        };

        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| HttpError::Timeout(timeout))??;

        if !response.status.is_success() {
            return Err(HttpError::Status {
                status: response.status,
                body: response.text(),
            });
        }

        Ok(response)
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! One-shot raw HTTP/1.1 responder for exercising clients.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serve `status_line`/`body` to every connection; the request head of
    /// each connection is forwarded on the returned channel.
    pub async fn serve(status_line: &'static str, body: String) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let tx = tx.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status_line,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (port, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_collects_body() {
        let (port, mut requests) = test_server::serve("200 OK", "hello".to_string()).await;
        let client = HttpClient::new();

        let response = client
            .get(&format!("http://127.0.0.1:{}/api", port), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "hello");
        let head = requests.recv().await.unwrap();
        assert!(head.starts_with("GET /api HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (port, _requests) = test_server::serve("404 Not Found", "missing".to_string()).await;
        let client = HttpClient::new();

        let err = client
            .post(&format!("http://127.0.0.1:{}/v3/paths/kick/x", port), Bytes::new(), Duration::from_secs(2))
            .await
            .unwrap_err();

        match err {
            HttpError::Status { status, body } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body, "missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = HttpClient::new()
            .get(&format!("http://127.0.0.1:{}/", port), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Transport(_)));
    }
}
