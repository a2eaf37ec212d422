//! RDAP wire client.
//!
//! Structured successor to WHOIS: `GET {base}/domain/{name}` returning JSON.
//! The raw body is preserved alongside the parsed document so the store
//! always keeps the registry's exact words.
//!
//! Proxy configuration comes from the process environment (`HTTP_PROXY`,
//! `HTTPS_PROXY`, `ALL_PROXY` including SOCKS5); reqwest picks those up on
//! its own.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::errors::MonitorError;

/// Some registries (ch/li among them) refuse requests without a browser
/// User-Agent, so we present one.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct RdapClient {
    client: reqwest::Client,
}

/// Result of one RDAP query.
#[derive(Debug)]
pub enum RdapOutcome {
    /// HTTP 200 with a parseable domain object; raw body attached.
    Found(Box<RdapDomain>, String),
    /// HTTP 404: no such registration. Raw body kept for diagnostics.
    NotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RdapDomain {
    #[serde(rename = "objectClassName")]
    pub object_class_name: Option<String>,
    pub handle: Option<String>,
    #[serde(rename = "ldhName")]
    pub ldh_name: Option<String>,
    #[serde(default)]
    pub status: Vec<String>,
    #[serde(default)]
    pub entities: Vec<RdapEntity>,
    #[serde(default)]
    pub events: Vec<RdapEvent>,
    #[serde(default)]
    pub nameservers: Vec<RdapNameserver>,
    #[serde(rename = "errorCode")]
    pub error_code: Option<i64>,
    pub title: Option<String>,
    #[serde(default)]
    pub description: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdapEntity {
    pub handle: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(rename = "vcardArray")]
    pub vcard_array: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdapEvent {
    #[serde(rename = "eventAction")]
    pub event_action: Option<String>,
    #[serde(rename = "eventDate")]
    pub event_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdapNameserver {
    #[serde(rename = "ldhName")]
    pub ldh_name: Option<String>,
}

impl RdapClient {
    pub fn new() -> Result<Self, MonitorError> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .gzip(true)
            .build()?;
        Ok(RdapClient { client })
    }

    /// Query one domain against an RDAP base URL. The timeout covers the
    /// whole round trip.
    pub async fn query(
        &self,
        domain: &str,
        base: &str,
        query_timeout: Duration,
    ) -> Result<RdapOutcome, MonitorError> {
        let url = endpoint_url(base, domain)?;
        debug!("RDAP query {url}");

        let response = self
            .client
            .get(url)
            .header("Accept", "application/rdap+json")
            .timeout(query_timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let raw = response.text().await?;

        match status {
            200 => {
                let doc: RdapDomain = serde_json::from_str(&raw)?;
                Ok(RdapOutcome::Found(Box::new(doc), raw))
            }
            404 => Ok(RdapOutcome::NotFound(raw)),
            429 => Err(MonitorError::RateLimited),
            other => {
                debug!("RDAP non-200 for {domain}: status={other}");
                Err(MonitorError::TransportStatus {
                    status: other,
                    body: raw,
                })
            }
        }
    }
}

/// `{base}/domain/{name}`, tolerating a trailing slash on the base.
fn endpoint_url(base: &str, domain: &str) -> Result<Url, MonitorError> {
    let joined = format!("{}/domain/{}", base.trim_end_matches('/'), domain);
    Url::parse(&joined)
        .map_err(|e| MonitorError::Internal(format!("invalid RDAP URL {joined:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_http(response: String) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        port
    }

    fn http_response(status_line: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/rdap+json\r\n\
             content-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn http_404_is_a_not_found_outcome_with_raw_body() {
        let port = serve_http(http_response(
            "404 Not Found",
            r#"{"errorCode": 404, "title": "Not Found"}"#,
        ))
        .await;
        let client = RdapClient::new().unwrap();
        let outcome = client
            .query(
                "missing.example",
                &format!("http://127.0.0.1:{port}"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        match outcome {
            RdapOutcome::NotFound(raw) => assert!(raw.contains("404")),
            RdapOutcome::Found(..) => panic!("404 must map to NotFound"),
        }
    }

    #[tokio::test]
    async fn http_429_is_rate_limited() {
        let port = serve_http(http_response("429 Too Many Requests", "{}")).await;
        let client = RdapClient::new().unwrap();
        let err = client
            .query(
                "busy.example",
                &format!("http://127.0.0.1:{port}"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::RateLimited));
    }

    #[tokio::test]
    async fn http_500_carries_status_and_body() {
        let port = serve_http(http_response("500 Internal Server Error", "oops")).await;
        let client = RdapClient::new().unwrap();
        let err = client
            .query(
                "broken.example",
                &format!("http://127.0.0.1:{port}"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        match err {
            MonitorError::TransportStatus { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn http_200_parses_the_domain_document() {
        let body = r#"{"ldhName": "LIVE.EXAMPLE", "status": ["active"]}"#;
        let port = serve_http(http_response("200 OK", body)).await;
        let client = RdapClient::new().unwrap();
        let outcome = client
            .query(
                "live.example",
                &format!("http://127.0.0.1:{port}"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        match outcome {
            RdapOutcome::Found(doc, raw) => {
                assert_eq!(doc.ldh_name.as_deref(), Some("LIVE.EXAMPLE"));
                assert_eq!(raw, body);
            }
            RdapOutcome::NotFound(_) => panic!("200 must map to Found"),
        }
    }

    #[tokio::test]
    async fn malformed_json_on_200_is_a_parse_error() {
        let port = serve_http(http_response("200 OK", "this is not json")).await;
        let client = RdapClient::new().unwrap();
        let err = client
            .query(
                "garbled.example",
                &format!("http://127.0.0.1:{port}"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Parse(_)));
    }

    #[test]
    fn endpoint_url_joins_with_and_without_trailing_slash() {
        let a = endpoint_url("https://rdap.verisign.com/com/v1", "example.com").unwrap();
        let b = endpoint_url("https://rdap.verisign.com/com/v1/", "example.com").unwrap();
        assert_eq!(a.as_str(), "https://rdap.verisign.com/com/v1/domain/example.com");
        assert_eq!(a, b);
    }

    #[test]
    fn domain_document_deserializes() {
        let body = r#"{
            "objectClassName": "domain",
            "ldhName": "EXAMPLE.COM",
            "status": ["client transfer prohibited", "server delete prohibited"],
            "entities": [
                {"handle": "376", "roles": ["registrar"]}
            ],
            "events": [
                {"eventAction": "registration", "eventDate": "1995-08-14T04:00:00Z"},
                {"eventAction": "expiration", "eventDate": "2026-08-13T04:00:00Z"}
            ],
            "nameservers": [
                {"ldhName": "A.IANA-SERVERS.NET"},
                {"ldhName": "B.IANA-SERVERS.NET"}
            ]
        }"#;
        let doc: RdapDomain = serde_json::from_str(body).unwrap();
        assert_eq!(doc.status.len(), 2);
        assert_eq!(doc.entities[0].roles, vec!["registrar"]);
        assert_eq!(doc.events.len(), 2);
        assert_eq!(doc.nameservers.len(), 2);
    }

    #[test]
    fn missing_arrays_default_to_empty() {
        let doc: RdapDomain = serde_json::from_str(r#"{"ldhName": "x.org"}"#).unwrap();
        assert!(doc.status.is_empty());
        assert!(doc.entities.is_empty());
        assert!(doc.events.is_empty());
        assert!(doc.nameservers.is_empty());
    }
}
