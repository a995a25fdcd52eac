//! HTTP transport to AnkiConnect, plus starting Anki when it is not running.

use std::future::Future;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use reqwest::{Client, Url};
use serde_json::Value;
use tokio::net::TcpStream;

use notesync_core::{AnkiService, Request, SyncError};

#[derive(Debug, Clone)]
pub struct HttpAnki {
    client: Client,
    url: String,
}

impl HttpAnki {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

impl AnkiService for HttpAnki {
    fn invoke(&self, request: &Request) -> impl Future<Output = Result<Value, SyncError>> + Send {
        let pending = self.client.post(&self.url).json(request).send();
        async move {
            let response = pending
                .await
                .map_err(|e| SyncError::Network(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(SyncError::Network(format!("service answered {status}")));
            }
            response
                .json::<Value>()
                .await
                .map_err(|e| SyncError::Envelope(e.to_string()))
        }
    }
}

/// `host:port` of the service URL.
pub fn service_addr(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

/// Wait until `addr` accepts TCP connections. Returns false on timeout.
pub async fn wait_for_port(addr: &str, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Start Anki in `profile`. The child is left running.
pub fn launch_anki(path: &Path, profile: &str) -> std::io::Result<()> {
    tracing::info!(path = %path.display(), profile, "starting Anki");
    Command::new(path).args(["-p", profile]).spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn addr_from_url() {
        assert_eq!(
            service_addr("http://127.0.0.1:8765").as_deref(),
            Some("127.0.0.1:8765")
        );
        assert_eq!(service_addr("http://localhost").as_deref(), Some("localhost:80"));
        assert_eq!(service_addr("not a url"), None);
    }

    #[tokio::test]
    async fn open_port_is_found() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(wait_for_port(&addr, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn closed_port_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(!wait_for_port(&addr, Duration::from_millis(200)).await);
    }
}
