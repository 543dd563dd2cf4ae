use std::time::Duration;

use crate::error::{CoreError, Result};

/// Downloads a subscription body over HTTP with a total deadline. Uses a
/// dedicated client with both an overall and a connect timeout, and
/// `no_proxy()` so the fetch itself never depends on the VPN connection
/// it is about to configure.
pub struct SubscriptionFetcher {
    client: reqwest::Client,
}

impl SubscriptionFetcher {
    pub fn new(deadline: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(deadline)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        Ok(Self { client })
    }

    /// Single operation: GET `url`, return the raw body as text. No
    /// retries at this layer.
    pub async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                CoreError::NetworkError(format!("subscription fetch timed out: {url}"))
            } else {
                CoreError::NetworkError(format!("{url}: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::HttpStatusError(status.as_u16()));
        }

        resp.text().await.map_err(|e| CoreError::NetworkError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_returns_body_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(200).set_body_string("vless://u@h:443#Tokyo"))
            .mount(&server)
            .await;

        let fetcher = SubscriptionFetcher::new(Duration::from_secs(5)).unwrap();
        let body = fetcher.fetch(&format!("{}/sub", server.uri())).await.unwrap();
        assert_eq!(body, "vless://u@h:443#Tokyo");
    }

    #[tokio::test]
    async fn fetch_maps_non_success_status_to_http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/missing")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let fetcher = SubscriptionFetcher::new(Duration::from_secs(5)).unwrap();
        let err = fetcher.fetch(&format!("{}/missing", server.uri())).await.unwrap_err();
        assert!(matches!(err, CoreError::HttpStatusError(404)));
    }

    #[tokio::test]
    async fn fetch_surfaces_timeout_as_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let fetcher = SubscriptionFetcher::new(Duration::from_millis(50)).unwrap();
        let err = fetcher.fetch(&format!("{}/slow", server.uri())).await.unwrap_err();
        assert!(matches!(err, CoreError::NetworkError(_)));
    }
}
