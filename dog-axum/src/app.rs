use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use dog_core::DogConfigSnapshot;
use dog_tus::ResumableUploads;
use tokio::net::TcpListener;

use crate::tus::tus_router;

/// Listener and routing settings for the upload server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where the upload routes are mounted
    pub base_path: String,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3030,
            base_path: "/files/upload".to_string(),
            request_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl ServerConfig {
    /// Keys: `http.host`, `http.port`, `http.base_path`,
    /// `http.request_timeout_secs`.
    pub fn from_config(config: &DogConfigSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            host: config.get_string("http.host").unwrap_or(defaults.host),
            port: config
                .get("http.port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            base_path: config.get_string("http.base_path").unwrap_or(defaults.base_path),
            request_timeout: config
                .get_secs("http.request_timeout_secs")
                .unwrap_or(defaults.request_timeout),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct TusApp {
    pub config: ServerConfig,
    pub router: Router<()>,
}

impl TusApp {
    pub fn new(uploads: Arc<dyn ResumableUploads>, config: ServerConfig) -> Self {
        let routes = tus_router(uploads, config.request_timeout);
        let base_path = config.base_path.trim_end_matches('/');
        let router = if base_path.is_empty() {
            Router::new().merge(routes)
        } else {
            Router::new().nest(base_path, routes)
        };
        Self { config, router }
    }

    pub fn use_router(mut self, path: &str, router: Router<()>) -> Self {
        self.router = self.router.nest(path, router);
        self
    }

    pub async fn listen(self) -> anyhow::Result<()> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, base_path = %self.config.base_path, "Upload server listening");
        axum::serve(listener, self.router).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_core::DogConfig;

    #[test]
    fn reads_http_settings() {
        let mut raw = DogConfig::new();
        raw.set("http.port", "8080");
        raw.set("http.base_path", "/uploads");
        raw.set("http.request_timeout_secs", "5");

        let config = ServerConfig::from_config(&raw.snapshot());
        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.base_path, "/uploads");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }
}
