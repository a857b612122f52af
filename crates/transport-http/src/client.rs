// HTTP client configuration and utilities

use std::time::Duration;
use streamplay_core::{AudioError, Result};

/// HTTP agent settings
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
    pub redirects: u32,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            user_agent: format!("streamplay/{}", env!("CARGO_PKG_VERSION")),
            redirects: 10,
        }
    }
}

impl HttpOptions {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Create a configured HTTP agent with proper timeouts and settings
pub fn create_http_agent(options: &HttpOptions) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(options.connect_timeout)
        .timeout_read(options.read_timeout)
        .user_agent(&options.user_agent)
        .redirects(options.redirects)
        .build()
}

/// Map a ureq failure onto the engine's error taxonomy
pub fn map_error(url: &str, err: ureq::Error) -> AudioError {
    match err {
        ureq::Error::Status(404, _) | ureq::Error::Status(410, _) => {
            AudioError::DataNotFound(format!("{} not found", url))
        }
        ureq::Error::Status(code, _) => {
            AudioError::NetworkError(format!("HTTP {} for {}", code, url))
        }
        ureq::Error::Transport(transport) => {
            AudioError::NetworkError(format!("Request to {} failed: {}", url, transport))
        }
    }
}

/// Total length from a `Content-Range: bytes a-b/total` header
pub fn parse_total_from_content_range(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse::<u64>().ok()
}

/// HTTP client wrapper
pub struct HttpClient {
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(options: &HttpOptions) -> Self {
        Self {
            agent: create_http_agent(options),
        }
    }

    /// GET starting at `start`, open-ended
    pub fn get_from(&self, url: &str, start: u64) -> Result<ureq::Response> {
        let request = self.agent.get(url);
        let request = if start > 0 {
            request.set("Range", &format!("bytes={}-", start))
        } else {
            request
        };
        request.call().map_err(|e| map_error(url, e))
    }

    pub fn head(&self, url: &str) -> Result<ureq::Response> {
        self.agent.head(url).call().map_err(|e| map_error(url, e))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(&HttpOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total() {
        assert_eq!(parse_total_from_content_range("bytes 100-199/5000"), Some(5000));
        assert_eq!(parse_total_from_content_range("bytes 0-0/*"), None);
    }
}
