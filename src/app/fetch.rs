use std::time::Duration;

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

use super::config::Settings;
use super::error::FetchError;
use super::types::{Document, DocumentTree, FetchMode, RawImage, SourceContext};
use super::webdriver::RenderedFetcher;

const META_SNIFF_BYTES: usize = 1024;

pub fn build_http_client(user_agent: &str, timeout: Duration) -> reqwest::Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(value) = reqwest::header::HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
}

/// Page acquisition strategy. Both variants hand back the same tree shape so
/// extraction does not care which one ran.
pub enum PageFetcher {
    Static(StaticFetcher),
    Rendered(RenderedFetcher),
}

impl PageFetcher {
    pub fn from_settings(settings: &Settings, client: reqwest::Client) -> Self {
        match settings.mode {
            FetchMode::Static => PageFetcher::Static(StaticFetcher::new(client)),
            FetchMode::Rendered => {
                PageFetcher::Rendered(RenderedFetcher::new(settings.webdriver.clone()))
            }
        }
    }

    pub fn mode(&self) -> FetchMode {
        match self {
            PageFetcher::Static(_) => FetchMode::Static,
            PageFetcher::Rendered(_) => FetchMode::Rendered,
        }
    }

    pub async fn fetch(&self, target: &Url) -> Result<DocumentTree, FetchError> {
        match self {
            PageFetcher::Static(fetcher) => fetcher.fetch(target).await,
            PageFetcher::Rendered(fetcher) => fetcher.fetch(target).await,
        }
    }
}

pub struct StaticFetcher {
    client: reqwest::Client,
}

impl StaticFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn fetch(&self, target: &Url) -> Result<DocumentTree, FetchError> {
        info!("fetching page {target}");
        let res = self
            .client
            .get(target.clone())
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: target.to_string(),
                source,
            })?;
        let status = res.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: target.to_string(),
                status: status.as_u16(),
            });
        }
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = res.bytes().await.map_err(|source| FetchError::Request {
            url: target.to_string(),
            source,
        })?;

        let html = decode_html(&body, content_type.as_deref());
        let document = parse_static_document(&html, target.clone());
        info!(
            "page fetched: {} bytes, {} <img> elements",
            body.len(),
            document.images.len()
        );
        Ok(DocumentTree::single(document))
    }
}

/// Every `<img>` in DOM order. Static pages never carry rendered sizes.
pub fn parse_static_document(html: &str, base_url: Url) -> Document {
    let doc = Html::parse_document(html);
    let images = match Selector::parse("img") {
        Ok(selector) => doc
            .select(&selector)
            .map(|el| RawImage::new(el.value().attr("src").unwrap_or_default()))
            .collect(),
        Err(_) => Vec::new(),
    };
    Document {
        base_url,
        source: SourceContext::Root,
        images,
    }
}

/// Header charset, then a `<meta>` charset near the top, then byte sniffing.
pub fn decode_html(body: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_param)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .or_else(|| meta_charset(body))
        .unwrap_or_else(|| sniff_encoding(body));
    debug!("decoding page as {}", encoding.name());
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}

fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn meta_charset(body: &[u8]) -> Option<&'static Encoding> {
    let head = &body[..body.len().min(META_SNIFF_BYTES)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    let start = head.find("charset=")? + "charset=".len();
    let label = head[start..]
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
        .collect::<String>();
    if label.is_empty() {
        return None;
    }
    Encoding::for_label(label.as_bytes())
}

fn sniff_encoding(body: &[u8]) -> &'static Encoding {
    if std::str::from_utf8(body).is_ok() {
        return UTF_8;
    }
    let mut detector = EncodingDetector::new();
    detector.feed(body, true);
    detector.guess(None, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_img_sources_in_dom_order() {
        let html = r#"<html><body>
            <img src="/a.jpg"><p><img src="b.png"></p><img alt="no src"><img src="">
        </body></html>"#;
        let base = Url::parse("https://example.com/blog/").unwrap();
        let doc = parse_static_document(html, base.clone());
        let srcs = doc.images.iter().map(|i| i.src.as_str()).collect::<Vec<_>>();
        assert_eq!(srcs, vec!["/a.jpg", "b.png", "", ""]);
        assert!(doc.images.iter().all(|i| i.width.is_none() && i.height.is_none()));
        assert_eq!(doc.base_url, base);
        assert_eq!(doc.source, SourceContext::Root);
    }

    #[test]
    fn header_charset_wins() {
        let (bytes, _, _) = encoding_rs::SHIFT_JIS.encode("<p>アキバ</p>");
        let text = decode_html(&bytes, Some("text/html; charset=Shift_JIS"));
        assert!(text.contains("アキバ"));
    }

    #[test]
    fn meta_charset_used_without_header() {
        let mut bytes = b"<html><head><meta charset=\"euc-jp\"></head><body>".to_vec();
        let (encoded, _, _) = encoding_rs::EUC_JP.encode("画像");
        bytes.extend_from_slice(&encoded);
        let text = decode_html(&bytes, Some("text/html"));
        assert!(text.contains("画像"));
    }

    #[test]
    fn valid_utf8_passes_through() {
        let text = decode_html("<p>ブログ</p>".as_bytes(), None);
        assert_eq!(text, "<p>ブログ</p>");
    }

    #[test]
    fn charset_param_parsing() {
        assert_eq!(
            charset_param("text/html; charset=\"UTF-8\""),
            Some("UTF-8".to_string())
        );
        assert_eq!(charset_param("text/html"), None);
    }
}
