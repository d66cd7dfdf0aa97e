//! MediaMTX SRT ingest URLs and control API.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, info};
use serde::Deserialize;
use uuid::Uuid;

use crate::http::HttpClient;

use super::StreamError;

/// Default SRT ingest port
pub const DEFAULT_SRT_PORT: u16 = 8890;

/// Default HTTP API port
pub const DEFAULT_API_PORT: u16 = 9997;

/// Timeout for API calls
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Where streams are published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMtxEndpoint {
    pub server: String,
    pub srt_port: u16,
    pub api_port: u16,
    /// Optional publish credentials appended to the stream id
    pub credentials: Option<(String, String)>,
}

impl Default for MediaMtxEndpoint {
    fn default() -> Self {
        Self::new("returnfeed.net")
    }
}

impl MediaMtxEndpoint {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            srt_port: DEFAULT_SRT_PORT,
            api_port: DEFAULT_API_PORT,
            credentials: None,
        }
    }

    /// `srt://<server>:<port>?streamid=publish:<name>[:<user>:<pass>]&pkt_size=1316`
    pub fn publish_url(&self, stream_name: &str) -> String {
        let mut stream_id = format!("publish:{}", stream_name);
        if let Some((user, pass)) = &self.credentials {
            stream_id.push_str(&format!(":{}:{}", user, pass));
        }
        format!(
            "srt://{}:{}?streamid={}&pkt_size=1316",
            self.server, self.srt_port, stream_id
        )
    }

    /// `srt://<server>:<port>?streamid=read:<name>`
    pub fn read_url(&self, stream_name: &str) -> String {
        format!(
            "srt://{}:{}?streamid=read:{}",
            self.server, self.srt_port, stream_name
        )
    }

    pub fn api_base(&self) -> String {
        format!("http://{}:{}", self.server, self.api_port)
    }
}

/// One entry of `/v3/paths/list`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub readers: Vec<serde_json::Value>,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub bytes_sent: u64,
}

impl PathInfo {
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }
}

#[derive(Debug, Deserialize)]
struct PathList {
    #[serde(default)]
    items: Vec<PathInfo>,
}

/// Parse a `/v3/paths/list` body.
pub fn parse_path_list(body: &str) -> Result<Vec<PathInfo>, StreamError> {
    let list: PathList =
        serde_json::from_str(body).map_err(|e| StreamError::Api(format!("invalid path list: {}", e)))?;
    Ok(list.items)
}

/// MediaMTX HTTP API client
#[derive(Clone)]
pub struct MediaMtxClient {
    endpoint: MediaMtxEndpoint,
    http: HttpClient,
}

impl MediaMtxClient {
    pub fn new(endpoint: MediaMtxEndpoint) -> Self {
        Self {
            endpoint,
            http: HttpClient::new(),
        }
    }

    pub fn endpoint(&self) -> &MediaMtxEndpoint {
        &self.endpoint
    }

    /// All paths currently known to the server
    pub async fn list_paths(&self) -> Result<Vec<PathInfo>, StreamError> {
        let url = format!("{}/v3/paths/list", self.endpoint.api_base());
        let response = self
            .http
            .get(&url, API_TIMEOUT)
            .await
            .map_err(|e| StreamError::Api(e.to_string()))?;
        let paths = parse_path_list(&response.text())?;
        debug!("[Stream] MediaMTX reports {} paths", paths.len());
        Ok(paths)
    }

    pub async fn find_path(&self, stream_name: &str) -> Result<Option<PathInfo>, StreamError> {
        Ok(self
            .list_paths()
            .await?
            .into_iter()
            .find(|p| p.name == stream_name))
    }

    /// True if the server lists a path with this name
    pub async fn is_active(&self, stream_name: &str) -> Result<bool, StreamError> {
        Ok(self.find_path(stream_name).await?.is_some())
    }

    /// Disconnect the publisher of `stream_name`.
    pub async fn kick(&self, stream_name: &str) -> Result<(), StreamError> {
        let url = format!("{}/v3/paths/kick/{}", self.endpoint.api_base(), stream_name);
        self.http
            .post(&url, Bytes::new(), API_TIMEOUT)
            .await
            .map_err(|e| StreamError::Api(e.to_string()))?;
        info!("[Stream] Kicked publisher of {}", stream_name);
        Ok(())
    }
}

/// `<user_id>_<unique_address>_<unix seconds>`
pub fn generate_stream_key(user_id: &str, unique_address: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{}_{}_{}", user_id, unique_address, ts)
}

/// Per-desk address: first 8 hex digits of a v4 UUID, upper case
pub fn generate_unique_address() -> String {
    Uuid::new_v4().simple().to_string().chars().take(8).collect::<String>().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_server;

    #[test]
    fn test_publish_url() {
        let endpoint = MediaMtxEndpoint::default();
        assert_eq!(
            endpoint.publish_url("pd_cam1"),
            "srt://returnfeed.net:8890?streamid=publish:pd_cam1&pkt_size=1316"
        );

        let endpoint = MediaMtxEndpoint {
            credentials: Some(("user".to_string(), "secret".to_string())),
            ..MediaMtxEndpoint::new("10.0.0.2")
        };
        assert_eq!(
            endpoint.publish_url("pd_cam1"),
            "srt://10.0.0.2:8890?streamid=publish:pd_cam1:user:secret&pkt_size=1316"
        );
    }

    #[test]
    fn test_read_url() {
        assert_eq!(
            MediaMtxEndpoint::default().read_url("pd_cam1"),
            "srt://returnfeed.net:8890?streamid=read:pd_cam1"
        );
    }

    #[test]
    fn test_parse_path_list() {
        let body = r#"{
            "itemCount": 2,
            "pageCount": 1,
            "items": [
                {"name": "pd_cam1", "ready": true, "tracks": ["H264", "MPEG-4 Audio"],
                 "bytesReceived": 123456, "bytesSent": 654321,
                 "readers": [{"type": "srtConn", "id": "a"}, {"type": "webRTCSession", "id": "b"}]},
                {"name": "idle"}
            ]
        }"#;
        let paths = parse_path_list(body).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].bytes_received, 123456);
        assert_eq!(paths[0].reader_count(), 2);
        assert!(!paths[1].ready);
        assert!(parse_path_list("not json").is_err());
    }

    #[test]
    fn test_stream_key_shape() {
        let key = generate_stream_key("user1", "abc");
        let parts: Vec<&str> = key.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(&parts[..2], &["user1", "abc"]);
        assert!(parts[2].parse::<u64>().unwrap() > 1_600_000_000);
    }

    #[test]
    fn test_unique_address_shape() {
        let address = generate_unique_address();
        assert_eq!(address.len(), 8);
        assert!(address.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        assert_ne!(address, generate_unique_address());
        assert!(!generate_stream_key("pd", &address).contains("local"));
    }

    #[tokio::test]
    async fn test_find_path_against_server() {
        let body = r#"{"items": [{"name": "live", "ready": true}]}"#.to_string();
        let (port, _requests) = test_server::serve("200 OK", body).await;
        let client = MediaMtxClient::new(MediaMtxEndpoint {
            api_port: port,
            ..MediaMtxEndpoint::new("127.0.0.1")
        });

        assert!(client.is_active("live").await.unwrap());
        assert!(!client.is_active("other").await.unwrap());
    }
}
