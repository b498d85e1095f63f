//! HTTP probe transport.
//!
//! Performs a single GET against a health endpoint over a plain TCP
//! connection. Anything other than a 2xx answer inside the timeout —
//! non-2xx status, connect or handshake error, timeout — is a failing
//! probe.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use vershift_platform::{ProbeClient, ProbeOutcome};

/// Probe client speaking HTTP/1.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProber;

impl HttpProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProbeClient for HttpProber {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let uri: http::Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                debug!(error = %e, %url, "health probe url unparseable");
                return ProbeOutcome::Fail;
            }
        };
        let Some(authority) = uri.authority().cloned() else {
            debug!(%url, "health probe url missing authority");
            return ProbeOutcome::Fail;
        };
        let address = match authority.port_u16() {
            Some(_) => authority.as_str().to_string(),
            None => format!("{}:80", authority.as_str()),
        };

        let result = tokio::time::timeout(timeout, async {
            let stream = match tokio::net::TcpStream::connect(&address).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(error = %e, %url, "health probe connection failed");
                    return ProbeOutcome::Fail;
                }
            };

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, %url, "health probe handshake failed");
                    return ProbeOutcome::Fail;
                }
            };

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let path = uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            let req = match http::Request::builder()
                .method("GET")
                .uri(&path)
                .header("host", authority.as_str())
                .header("user-agent", "vershift-health/0.1")
                .body(http_body_util::Empty::<bytes::Bytes>::new())
            {
                Ok(req) => req,
                Err(e) => {
                    debug!(error = %e, %url, "health probe request build failed");
                    return ProbeOutcome::Fail;
                }
            };

            match sender.send_request(req).await {
                Ok(resp) => {
                    if resp.status().is_success() {
                        ProbeOutcome::Pass
                    } else {
                        debug!(status = %resp.status(), %url, "health probe non-2xx");
                        ProbeOutcome::Fail
                    }
                }
                Err(e) => {
                    debug!(error = %e, %url, "health probe request failed");
                    ProbeOutcome::Fail
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(%url, "health probe timed out");
                ProbeOutcome::Fail
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_to_closed_port_fails() {
        let prober = HttpProber::new();
        let outcome = prober
            .probe("http://127.0.0.1:1/healthz", Duration::from_millis(100))
            .await;
        assert_eq!(outcome, ProbeOutcome::Fail);
    }

    #[tokio::test]
    async fn probe_bad_url_fails() {
        let prober = HttpProber::new();
        let outcome = prober.probe("not a url", Duration::from_millis(100)).await;
        assert_eq!(outcome, ProbeOutcome::Fail);
    }
}
