use anyhow::Result;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::SourceError;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

pub(crate) fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// Shared reqwest client for the resolution and rating sources.
///
/// Cheap to clone; every source holds its own copy.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()?;
        Ok(Self { http, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.http.get(url)
    }

    /// Send, require 2xx, and return the body as text.
    pub async fn fetch_text(&self, req: RequestBuilder) -> Result<String, SourceError> {
        let resp = req.send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 300);
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.text().await.map_err(|e| self.classify(e))
    }

    /// Send, require 2xx, and decode the body as JSON.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
    ) -> Result<T, SourceError> {
        let body = self.fetch_text(req).await?;
        serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))
    }

    fn classify(&self, err: reqwest::Error) -> SourceError {
        if err.is_timeout() {
            SourceError::Timeout(self.timeout)
        } else {
            SourceError::Network(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundary() {
        let s = truncate_for_log("ошибка сервера".to_string(), 5);
        assert!(s.ends_with('…'));
        assert!(s.len() <= 5 + '…'.len_utf8());
    }

    #[test]
    fn client_builds_with_timeout() {
        let client = HttpClient::new(Duration::from_secs(4)).unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(4));
    }
}
