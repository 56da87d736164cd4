use std::collections::HashSet;

use tracing::debug;
use url::Url;

use super::types::{DocumentTree, ImageCandidate};

/// Root first, then frames in browser order. The first occurrence of a URL
/// wins; later duplicates are dropped even when they come from another frame.
pub fn extract_candidates(tree: &DocumentTree) -> Vec<ImageCandidate> {
    let mut seen = HashSet::<String>::new();
    let mut candidates = Vec::new();

    for document in tree.documents() {
        for raw in &document.images {
            let src = raw.src.trim();
            if src.is_empty() {
                continue;
            }
            let Some(url) = resolve_image_url(&document.base_url, src) else {
                debug!(
                    "unresolvable image reference in {}: {src}",
                    document.source.label()
                );
                continue;
            };
            if !seen.insert(url.as_str().to_string()) {
                continue;
            }
            candidates.push(ImageCandidate {
                url,
                source: document.source.clone(),
                reported_width: raw.width,
                reported_height: raw.height,
            });
        }
    }

    candidates
}

pub fn resolve_image_url(base: &Url, src: &str) -> Option<Url> {
    base.join(src)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::{Document, RawImage, SourceContext};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn root(base: &str, srcs: &[&str]) -> Document {
        Document {
            base_url: url(base),
            source: SourceContext::Root,
            images: srcs.iter().map(|s| RawImage::new(*s)).collect(),
        }
    }

    fn frame(base: &str, images: Vec<RawImage>) -> Document {
        Document {
            base_url: url(base),
            source: SourceContext::Frame(url(base)),
            images,
        }
    }

    #[test]
    fn static_page_yields_absolute_urls_in_order() {
        let tree = DocumentTree::single(root(
            "http://x/",
            &["http://x/a.jpg", "http://x/banner_ad.jpg", "http://x/b.png?v=1"],
        ));
        let urls = extract_candidates(&tree)
            .into_iter()
            .map(|c| c.url.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec!["http://x/a.jpg", "http://x/banner_ad.jpg", "http://x/b.png?v=1"]
        );
    }

    #[test]
    fn relative_sources_resolve_against_their_own_document() {
        let tree = DocumentTree {
            root: root("https://blog.example.com/archives/1.html", &["../img/a.jpg"]),
            frames: vec![frame(
                "https://ads.reajyu.net/box/index.html",
                vec![RawImage::new("creative.jpg")],
            )],
        };
        let candidates = extract_candidates(&tree);
        assert_eq!(candidates[0].url.as_str(), "https://blog.example.com/img/a.jpg");
        assert_eq!(candidates[0].source, SourceContext::Root);
        assert_eq!(
            candidates[1].url.as_str(),
            "https://ads.reajyu.net/box/creative.jpg"
        );
        assert!(matches!(candidates[1].source, SourceContext::Frame(_)));
    }

    #[test]
    fn duplicates_keep_first_occurrence_across_frames() {
        let tree = DocumentTree {
            root: root("https://a.test/", &["/1.jpg", "/2.jpg", "/1.jpg"]),
            frames: vec![
                frame(
                    "https://a.test/frame.html",
                    vec![RawImage::new("/2.jpg"), RawImage::new("/3.jpg")],
                ),
                frame("https://b.test/", vec![RawImage::new("https://a.test/3.jpg")]),
            ],
        };
        let candidates = extract_candidates(&tree);
        let urls = candidates.iter().map(|c| c.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec!["https://a.test/1.jpg", "https://a.test/2.jpg", "https://a.test/3.jpg"]
        );
        assert_eq!(candidates[1].source, SourceContext::Root);
        assert_eq!(
            candidates[2].source,
            SourceContext::Frame(url("https://a.test/frame.html"))
        );

        let unique = urls.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), urls.len());
    }

    #[test]
    fn skips_empty_and_non_http_sources() {
        let tree = DocumentTree::single(root(
            "https://a.test/",
            &["", "   ", "data:image/gif;base64,R0lGOD", "javascript:void(0)", "/ok.png"],
        ));
        let candidates = extract_candidates(&tree);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url.as_str(), "https://a.test/ok.png");
    }

    #[test]
    fn reported_dimensions_are_carried() {
        let tree = DocumentTree::single(Document {
            base_url: url("https://a.test/"),
            source: SourceContext::Root,
            images: vec![RawImage::with_size("/big.jpg", Some(800), Some(600))],
        });
        let candidate = &extract_candidates(&tree)[0];
        assert_eq!(candidate.reported_width, Some(800));
        assert_eq!(candidate.reported_height, Some(600));
    }
}
