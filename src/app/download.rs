use tracing::debug;
use url::Url;

use super::error::DownloadError;
use super::filter::image_dimensions;
use super::types::DownloadResult;

pub struct ImageFetcher {
    client: reqwest::Client,
}

impl ImageFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// One GET, no retries.
    pub async fn fetch(&self, url: &Url) -> Result<DownloadResult, DownloadError> {
        let res = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| DownloadError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = res.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = res.bytes().await.map_err(|source| DownloadError::Request {
            url: url.to_string(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(DownloadError::Empty {
                url: url.to_string(),
            });
        }

        let content_dimensions = image_dimensions(&bytes);
        debug!(
            "downloaded {url}: {} bytes, dimensions {content_dimensions:?}",
            bytes.len()
        );
        Ok(DownloadResult {
            url: url.clone(),
            bytes: bytes.to_vec(),
            content_dimensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::app::fetch::build_http_client;

    fn client() -> reqwest::Client {
        build_http_client("imgrab-test", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/gone.jpg")
            .with_status(404)
            .create_async()
            .await;
        let url = Url::parse(&format!("{}/gone.jpg", server.url())).unwrap();
        let err = ImageFetcher::new(client()).fetch(&url).await.unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn empty_body_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/empty.jpg")
            .with_status(200)
            .create_async()
            .await;
        let url = Url::parse(&format!("{}/empty.jpg", server.url())).unwrap();
        let err = ImageFetcher::new(client()).fetch(&url).await.unwrap_err();
        assert!(matches!(err, DownloadError::Empty { .. }));
    }

    #[tokio::test]
    async fn sends_browser_like_user_agent() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/ua.jpg")
            .match_header("user-agent", "imgrab-test")
            .with_status(200)
            .with_body("not really an image")
            .create_async()
            .await;
        let url = Url::parse(&format!("{}/ua.jpg", server.url())).unwrap();
        let result = ImageFetcher::new(client()).fetch(&url).await.unwrap();
        assert_eq!(result.url, url);
        assert_eq!(result.bytes, b"not really an image");
        assert_eq!(result.content_dimensions, None);
        m.assert_async().await;
    }
}
