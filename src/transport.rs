//! HTTPS transport with mutual TLS.
//!
//! The reqwest client is built once from the credential bundle and reused for
//! every call. Without credentials the client skips peer verification, which
//! is only meant for non-production test endpoints.

use crate::config::{CredentialBundle, TransportConfig};
use crate::error::{VbmsError, VbmsResult};
use reqwest::header::HeaderMap;
use reqwest::{Certificate, Client, Identity, StatusCode};
use std::error::Error as StdError;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Status, headers and raw body of an HTTP response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// HTTP client with retry support for the VBMS endpoints.
#[derive(Clone)]
pub struct TransportClient {
    client: Client,
    max_attempts: u32,
    base_backoff: Duration,
    request_timeout: Duration,
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("max_attempts", &self.max_attempts)
            .field("base_backoff", &self.base_backoff)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl TransportClient {
    pub fn new(config: &TransportConfig, credentials: Option<&CredentialBundle>) -> VbmsResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout());

        match credentials {
            Some(bundle) => {
                let identity = load_identity(bundle)?;
                let ca = read_file(&bundle.ca_cert_file)?;
                let ca = Certificate::from_pem(&ca).map_err(|e| {
                    VbmsError::Config(format!(
                        "Invalid CA certificate {}: {}",
                        bundle.ca_cert_file.display(),
                        e
                    ))
                })?;
                builder = builder
                    .identity(identity)
                    .tls_built_in_root_certs(false)
                    .add_root_certificate(ca);
                debug!(ca = %bundle.ca_cert_file.display(), "Mutual TLS configured");
            }
            None => {
                warn!("No credentials configured, TLS peer verification is disabled");
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let client = builder
            .build()
            .map_err(|e| VbmsError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_attempts: config.retry.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry.backoff_ms),
            request_timeout: config.request_timeout(),
        })
    }

    /// POST `body` to `url`. Connection failures are retried up to the
    /// configured attempt count; any HTTP status is returned as a response.
    pub async fn send(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: HeaderMap,
        timeout: Option<Duration>,
    ) -> VbmsResult<TransportResponse> {
        let timeout = timeout.unwrap_or(self.request_timeout);

        for attempt in 1..=self.max_attempts {
            debug!(attempt, url, bytes = body.len(), "Sending request");
            match self.attempt(url, body.clone(), headers.clone(), timeout).await {
                Ok(response) => {
                    debug!(attempt, url, status = %response.status, bytes = response.body.len(), "Received response");
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    warn!(attempt, url, error = %err, "Request failed, retrying");
                    self.sleep_with_backoff(attempt).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(VbmsError::Connection(format!(
            "No attempt made to {}",
            url
        )))
    }

    async fn attempt(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: HeaderMap,
        timeout: Duration,
    ) -> VbmsResult<TransportResponse> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify_error)?;

        Ok(TransportResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    fn backoff_delay(&self, retry_number: u32) -> Duration {
        let shift = retry_number.saturating_sub(1).min(8);
        self.base_backoff.saturating_mul(1u32 << shift)
    }

    async fn sleep_with_backoff(&self, retry_number: u32) {
        let delay = self.backoff_delay(retry_number);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Build the client identity. A `.p12`/`.pfx` key file is read as a PKCS#12
/// bundle; anything else as a PEM key, decrypted with the key password when
/// it is encrypted, paired with the PEM certificate.
pub fn load_identity(bundle: &CredentialBundle) -> VbmsResult<Identity> {
    let key = read_file(&bundle.key_file)?;
    let invalid = |e: &dyn std::fmt::Display| {
        VbmsError::Config(format!(
            "Invalid client key {}: {}",
            bundle.key_file.display(),
            e
        ))
    };

    let is_pkcs12 = bundle
        .key_file
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("p12") || ext.eq_ignore_ascii_case("pfx"));
    if is_pkcs12 {
        return Identity::from_pkcs12_der(&key, &bundle.key_password).map_err(|e| invalid(&e));
    }

    let pkey = if bundle.key_password.is_empty() {
        openssl::pkey::PKey::private_key_from_pem(&key)
    } else {
        openssl::pkey::PKey::private_key_from_pem_passphrase(&key, bundle.key_password.as_bytes())
    }
    .map_err(|e| invalid(&e))?;
    let key_pem = pkey.private_key_to_pem_pkcs8().map_err(|e| invalid(&e))?;

    let cert = read_file(&bundle.cert_file)?;
    Identity::from_pkcs8_pem(&cert, &key_pem).map_err(|e| {
        VbmsError::Config(format!(
            "Invalid client certificate {}: {}",
            bundle.cert_file.display(),
            e
        ))
    })
}

fn read_file(path: &Path) -> VbmsResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| VbmsError::Config(format!("Cannot read {}: {}", path.display(), e)))
}

/// Split reqwest failures into TLS handshake problems and everything else.
/// Only a TLS error in the source chain counts as a handshake failure.
fn classify_error(err: reqwest::Error) -> VbmsError {
    let chain = error_chain(&err);
    if err.is_timeout() {
        VbmsError::Connection(format!("Timed out: {}", chain))
    } else if is_tls_failure(&err) {
        VbmsError::TlsHandshake(chain)
    } else if err.is_connect() {
        VbmsError::Connection(format!("Connect failed: {}", chain))
    } else {
        VbmsError::Connection(chain)
    }
}

fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(cause) = source {
        if cause.is::<native_tls::Error>()
            || cause.is::<openssl::ssl::Error>()
            || cause.is::<openssl::error::ErrorStack>()
        {
            return true;
        }
        source = cause.source();
    }
    false
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use reqwest::header::{HeaderValue, CONTENT_TYPE};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(max_attempts: u32) -> TransportConfig {
        TransportConfig {
            connect_timeout_secs: 2,
            request_timeout_secs: 5,
            retry: RetryConfig {
                max_attempts,
                backoff_ms: 10,
            },
        }
    }

    fn xml_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/xml;charset=UTF-8"));
        headers
    }

    #[tokio::test]
    async fn test_send_returns_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/svc"))
            .and(header("content-type", "text/xml;charset=UTF-8"))
            .and(body_string("<e/>"))
            .respond_with(ResponseTemplate::new(500).set_body_string("<fault/>"))
            .expect(1)
            .mount(&server)
            .await;

        let client = TransportClient::new(&config(3), None).unwrap();
        let response = client
            .send(
                &format!("{}/svc", server.uri()),
                b"<e/>".to_vec(),
                xml_headers(),
                None,
            )
            .await
            .unwrap();

        // HTTP errors are not retried; the body still carries the fault
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body, b"<fault/>");
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TransportClient::new(&config(2), None).unwrap();
        let err = client
            .send(
                &format!("http://127.0.0.1:{}/svc", port),
                Vec::new(),
                HeaderMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VbmsError::Connection(_)), "{err}");
    }

    /// Plain TCP server that drops the first `drop_first` connections and
    /// answers every later one with a fixed HTTP response. Returns its
    /// address and the number of connections accepted.
    async fn counting_server(drop_first: usize) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                if seen < drop_first {
                    drop(stream);
                    continue;
                }
                let mut buf = vec![0u8; 64 * 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\n<ok/>",
                    )
                    .await;
                let _ = stream.shutdown().await;
            }
        });
        (addr, accepted)
    }

    #[tokio::test]
    async fn test_dropped_connection_is_retried() {
        let (addr, accepted) = counting_server(1).await;
        let client = TransportClient::new(&config(3), None).unwrap();
        let response = client
            .send(&format!("http://{}/svc", addr), b"<e/>".to_vec(), xml_headers(), None)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, b"<ok/>");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connection_errors_use_every_attempt() {
        let (addr, accepted) = counting_server(usize::MAX).await;
        let client = TransportClient::new(&config(3), None).unwrap();
        let err = client
            .send(&format!("http://{}/svc", addr), b"<e/>".to_vec(), xml_headers(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VbmsError::Connection(_)), "{err}");
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_tls_failure_is_not_retried() {
        // plain HTTP answer to a ClientHello
        let (addr, accepted) = counting_server(0).await;
        let client = TransportClient::new(&config(3), None).unwrap();
        let err = client
            .send(&format!("https://{}/svc", addr), b"<e/>".to_vec(), xml_headers(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VbmsError::TlsHandshake(_)), "{err}");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tls_words_in_url_do_not_make_a_handshake_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TransportClient::new(&config(3), None).unwrap();
        let started = Instant::now();
        let err = client
            .send(
                &format!("http://127.0.0.1:{}/vbms-ssl/tls/certificate", port),
                Vec::new(),
                HeaderMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VbmsError::Connection(_)), "{err}");
        // two backoff sleeps: 10ms then 20ms
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_per_call_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = TransportClient::new(&config(1), None).unwrap();
        let err = client
            .send(
                &server.uri(),
                Vec::new(),
                HeaderMap::new(),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VbmsError::Connection(_)));
    }

    #[test]
    fn test_backoff_doubles() {
        let client = TransportClient::new(&config(4), None).unwrap();
        assert_eq!(client.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(client.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(client.backoff_delay(3), Duration::from_millis(40));
    }

    #[test]
    fn test_missing_key_file() {
        let bundle = CredentialBundle {
            key_file: "/nonexistent/client.key".into(),
            key_password: "secret".to_string(),
            cert_file: "/nonexistent/client.crt".into(),
            ca_cert_file: "/nonexistent/ca.crt".into(),
            saml_assertion_path: "/nonexistent/saml.xml".into(),
        };
        let err = TransportClient::new(&config(1), Some(&bundle)).unwrap_err();
        assert!(matches!(err, VbmsError::Config(_)));
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn test_invalid_pem_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("client.key");
        std::fs::write(&key, "not a key").unwrap();
        let bundle = CredentialBundle {
            key_file: key,
            key_password: String::new(),
            cert_file: dir.path().join("client.crt"),
            ca_cert_file: dir.path().join("ca.crt"),
            saml_assertion_path: dir.path().join("saml.xml"),
        };
        let err = load_identity(&bundle).unwrap_err();
        assert!(err.to_string().contains("Invalid client key"));
    }
}
