use super::HealthProbe;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{redirect, Client};
use std::sync::OnceLock;
use std::time::Duration;

/// Global shared HTTP client for probes and mesh calls.
///
/// One client keeps one connection pool for every service instance on the
/// host. The client-level timeout is only a fallback; each request sets
/// its own.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

/// Get or create the shared HTTP client. Redirects are not followed, so a
/// 3xx answer from a health endpoint is reported as-is.
pub(crate) fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .redirect(redirect::Policy::none())
            .build()
            .expect("Failed to create shared HTTP client")
    })
}

/// Validate that a URL is well-formed and uses HTTP/HTTPS scheme.
pub fn validate_url(url: &str) -> Result<url::Url> {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            if scheme != "http" && scheme != "https" {
                return Err(Error::Config(format!(
                    "Invalid health check URL '{}': scheme must be http or https, got '{}'",
                    url, scheme
                )));
            }
            Ok(parsed)
        }
        Err(e) => Err(Error::Config(format!(
            "Invalid health check URL '{}': {}",
            url, e
        ))),
    }
}

/// Probes with `GET <url>`: 2xx and 3xx are healthy.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProbe {
    /// Probe backed by the shared client.
    pub fn new() -> Self {
        Self {
            client: shared_client().clone(),
        }
    }

    /// Probe backed by a caller-supplied client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> bool {
        if let Err(e) = validate_url(url) {
            tracing::warn!("{}", e);
            return false;
        }

        // Per-request timeout overrides the shared client's fallback
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status();
                let healthy = status.is_success() || status.is_redirection();
                if !healthy {
                    tracing::debug!(url, status = status.as_u16(), "Health probe returned error status");
                }
                healthy
            }
            Err(e) => {
                tracing::debug!(url, "Health probe failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response per connection.
    async fn serve(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nLocation: /elsewhere\r\nConnection: close\r\n\r\n",
                    status_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/health", addr)
    }

    #[tokio::test]
    async fn ok_status_is_healthy() {
        let url = serve("200 OK").await;
        assert!(HttpProbe::new().probe(&url, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn redirect_counts_as_healthy() {
        let url = serve("302 Found").await;
        assert!(HttpProbe::new().probe(&url, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn server_error_is_unhealthy() {
        let url = serve("503 Service Unavailable").await;
        assert!(!HttpProbe::new().probe(&url, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn unreachable_port_is_unhealthy() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/health", port);
        assert!(!HttpProbe::new().probe(&url, Duration::from_secs(1)).await);
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(validate_url("ftp://localhost/health").is_err());
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("https://localhost:6090/health").is_ok());
    }
}
