use std::io::Cursor;

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, info};

use super::config::Settings;
use super::types::{AcceptedImage, DownloadResult, FetchMode, ImageCandidate, SourceContext};

/// Why a candidate or a downloaded image was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("matches excluded pattern '{0}'")]
    ExcludedPattern(String),

    #[error("extension not allowed")]
    Extension,

    #[error("reported height {height:?} below {min}px")]
    BelowMinHeight { height: Option<u32>, min: u32 },

    #[error("host not in content domain list")]
    DomainNotAllowed,

    #[error("frame image outside always-accept domains")]
    FrameDomainNotAllowed,

    #[error("image too small: {width}x{height}")]
    TooSmall { width: u32, height: u32 },

    #[error("bytes are not a decodable image")]
    Undecodable,
}

#[derive(Debug, Clone)]
struct StaticRules {
    exclude_patterns: Vec<String>,
    valid_extensions: Vec<String>,
    min_image_size: u32,
}

#[derive(Debug, Clone)]
struct RenderedRules {
    min_height: u32,
    content_domains: Vec<String>,
    frame_domains: Vec<String>,
}

#[derive(Debug, Clone)]
enum Rules {
    Static(StaticRules),
    Rendered(RenderedRules),
}

#[derive(Debug, Clone)]
pub struct CandidateFilter {
    rules: Rules,
}

impl CandidateFilter {
    pub fn for_mode(mode: FetchMode, settings: &Settings) -> Self {
        let rules = match mode {
            FetchMode::Static => Rules::Static(StaticRules {
                exclude_patterns: lowercase_all(&settings.exclude_patterns),
                valid_extensions: lowercase_all(&settings.valid_extensions),
                min_image_size: settings.min_image_size,
            }),
            FetchMode::Rendered => Rules::Rendered(RenderedRules {
                min_height: settings.min_rendered_height,
                content_domains: normalize_domains(&settings.content_domains),
                frame_domains: normalize_domains(&settings.frame_domains),
            }),
        };
        Self { rules }
    }

    pub fn mode(&self) -> FetchMode {
        match self.rules {
            Rules::Static(_) => FetchMode::Static,
            Rules::Rendered(_) => FetchMode::Rendered,
        }
    }

    pub fn check_candidate(&self, candidate: &ImageCandidate) -> Result<(), Rejection> {
        match &self.rules {
            Rules::Static(rules) => {
                let lowered = candidate.url.as_str().to_lowercase();
                if let Some(pattern) = rules
                    .exclude_patterns
                    .iter()
                    .find(|p| lowered.contains(p.as_str()))
                {
                    return Err(Rejection::ExcludedPattern(pattern.clone()));
                }
                let path = candidate.url.path().to_lowercase();
                if !rules
                    .valid_extensions
                    .iter()
                    .any(|ext| path.ends_with(ext.as_str()))
                {
                    return Err(Rejection::Extension);
                }
                Ok(())
            }
            Rules::Rendered(rules) => {
                let host = candidate.url.host_str().unwrap_or_default();
                match &candidate.source {
                    SourceContext::Root => {
                        let tall_enough = candidate
                            .reported_height
                            .is_some_and(|h| h >= rules.min_height);
                        if !tall_enough {
                            return Err(Rejection::BelowMinHeight {
                                height: candidate.reported_height,
                                min: rules.min_height,
                            });
                        }
                        if !matches_any(host, &rules.content_domains) {
                            return Err(Rejection::DomainNotAllowed);
                        }
                        Ok(())
                    }
                    SourceContext::Frame(frame_url) => {
                        let frame_host = frame_url.host_str().unwrap_or_default();
                        if matches_any(host, &rules.frame_domains)
                            || matches_any(frame_host, &rules.frame_domains)
                        {
                            Ok(())
                        } else {
                            Err(Rejection::FrameDomainNotAllowed)
                        }
                    }
                }
            }
        }
    }

    /// Keeps order; every rejection is logged at debug level.
    pub fn admit(&self, candidates: Vec<ImageCandidate>) -> Vec<AcceptedImage> {
        let total = candidates.len();
        let accepted = candidates
            .into_iter()
            .filter_map(|candidate| match self.check_candidate(&candidate) {
                Ok(()) => Some(AcceptedImage::new(candidate)),
                Err(reason) => {
                    debug!(
                        "excluded {} [{}]: {reason}",
                        candidate.url,
                        candidate.source.label()
                    );
                    None
                }
            })
            .collect::<Vec<_>>();
        info!(
            "{} of {total} candidates accepted ({} rules)",
            accepted.len(),
            self.mode().label()
        );
        accepted
    }

    /// Post-download decision. Undecodable bytes are always rejected; the
    /// pixel minimum only applies to static fetches, where no rendered size
    /// was known up front.
    pub fn check_download(&self, download: &DownloadResult) -> Result<(), Rejection> {
        let Some((width, height)) = download.content_dimensions else {
            return Err(Rejection::Undecodable);
        };
        if let Rules::Static(rules) = &self.rules {
            if width < rules.min_image_size || height < rules.min_image_size {
                return Err(Rejection::TooSmall { width, height });
            }
        }
        Ok(())
    }
}

/// Reads just enough of the header to learn the pixel size.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// `img.reajyu.net` matches `reajyu.net`; `notreajyu.net` does not.
pub fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn matches_any(host: &str, domains: &[String]) -> bool {
    domains.iter().any(|domain| host_matches(host, domain))
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}

fn normalize_domains(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().trim_matches('.').to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, ImageFormat, RgbImage};
    use url::Url;

    use super::*;

    fn candidate(url: &str) -> ImageCandidate {
        ImageCandidate {
            url: Url::parse(url).unwrap(),
            source: SourceContext::Root,
            reported_width: None,
            reported_height: None,
        }
    }

    fn sized(url: &str, height: Option<u32>) -> ImageCandidate {
        ImageCandidate {
            reported_width: height,
            reported_height: height,
            ..candidate(url)
        }
    }

    fn in_frame(url: &str, frame: &str) -> ImageCandidate {
        ImageCandidate {
            source: SourceContext::Frame(Url::parse(frame).unwrap()),
            ..candidate(url)
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn download(bytes: Vec<u8>) -> DownloadResult {
        DownloadResult {
            url: Url::parse("http://x/a.png").unwrap(),
            content_dimensions: image_dimensions(&bytes),
            bytes,
        }
    }

    fn static_filter() -> CandidateFilter {
        CandidateFilter::for_mode(FetchMode::Static, &Settings::default())
    }

    fn rendered_filter() -> CandidateFilter {
        CandidateFilter::for_mode(FetchMode::Rendered, &Settings::default())
    }

    #[test]
    fn static_scenario_rejects_banner_keeps_rest() {
        let filter = static_filter();
        let accepted = filter.admit(vec![
            candidate("http://x/a.jpg"),
            candidate("http://x/banner_ad.jpg"),
            candidate("http://x/b.png?v=1"),
        ]);
        let urls = accepted.iter().map(|a| a.url().as_str()).collect::<Vec<_>>();
        assert_eq!(urls, vec!["http://x/a.jpg", "http://x/b.png?v=1"]);
        assert_eq!(accepted[0].candidate(), &candidate("http://x/a.jpg"));
    }

    #[test]
    fn excluded_patterns_are_case_insensitive_and_ignore_extension() {
        let filter = static_filter();
        for url in [
            "http://x/COUNTER/1.png",
            "http://x/img/Icon-home.jpg",
            "http://x/parts/small_parts/dot.gif",
            "http://x/bunner.webp",
            "http://x/x.jpg?ref=BUTTON",
        ] {
            assert!(
                matches!(
                    filter.check_candidate(&candidate(url)),
                    Err(Rejection::ExcludedPattern(_))
                ),
                "{url} should be excluded"
            );
        }
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        let filter = static_filter();
        for url in ["http://x/a.svg", "http://x/photo", "http://x/a.jpg.php", "http://x/?f=a.jpg"] {
            assert_eq!(
                filter.check_candidate(&sized(url, Some(5000))),
                Err(Rejection::Extension),
                "{url}"
            );
        }
        assert!(filter.check_candidate(&candidate("http://x/A.JPEG")).is_ok());
    }

    #[test]
    fn static_post_download_size_check() {
        let filter = static_filter();
        assert_eq!(
            filter.check_download(&download(png(9, 400))),
            Err(Rejection::TooSmall {
                width: 9,
                height: 400
            })
        );
        assert_eq!(
            filter.check_download(&download(png(400, 3))),
            Err(Rejection::TooSmall {
                width: 400,
                height: 3
            })
        );
        assert!(filter.check_download(&download(png(10, 10))).is_ok());
    }

    #[test]
    fn undecodable_bytes_are_rejected_in_both_modes() {
        let garbage = download(b"<html>not an image</html>".to_vec());
        assert_eq!(
            static_filter().check_download(&garbage),
            Err(Rejection::Undecodable)
        );
        assert_eq!(
            rendered_filter().check_download(&garbage),
            Err(Rejection::Undecodable)
        );
    }

    #[test]
    fn rendered_mode_skips_pixel_minimum_after_download() {
        assert!(rendered_filter().check_download(&download(png(2, 2))).is_ok());
    }

    #[test]
    fn rendered_root_needs_height_and_domain() {
        let filter = rendered_filter();
        assert!(matches!(
            filter.check_candidate(&sized("https://livedoor.blogimg.jp/a/b.jpg", Some(100))),
            Err(Rejection::BelowMinHeight { .. })
        ));
        assert!(matches!(
            filter.check_candidate(&sized("https://livedoor.blogimg.jp/a/b.jpg", None)),
            Err(Rejection::BelowMinHeight { .. })
        ));
        assert_eq!(
            filter.check_candidate(&sized("https://cdn.other.com/b.jpg", Some(600))),
            Err(Rejection::DomainNotAllowed)
        );
        assert!(
            filter
                .check_candidate(&sized("https://livedoor.blogimg.jp/a/b.jpg", Some(250)))
                .is_ok()
        );
    }

    #[test]
    fn rendered_mode_ignores_static_rules() {
        let filter = rendered_filter();
        assert!(
            filter
                .check_candidate(&sized("https://livedoor.blogimg.jp/banner/icon.svg", Some(300)))
                .is_ok()
        );
    }

    #[test]
    fn frame_candidates_on_always_accept_domain_pass_regardless_of_size() {
        let filter = rendered_filter();
        let tiny = ImageCandidate {
            reported_height: Some(1),
            ..in_frame("https://img.reajyu.net/c/1.jpg", "https://reajyu.net/ad.html")
        };
        assert!(filter.check_candidate(&tiny).is_ok());

        let cdn_in_ad_frame = in_frame("https://cdn.example.net/x.jpg", "https://www.reajyu.net/ad");
        assert!(filter.check_candidate(&cdn_in_ad_frame).is_ok());

        let elsewhere = in_frame("https://ads.other.net/x.jpg", "https://ads.other.net/frame");
        assert_eq!(
            filter.check_candidate(&elsewhere),
            Err(Rejection::FrameDomainNotAllowed)
        );
    }

    #[test]
    fn host_matching_respects_label_boundaries() {
        assert!(host_matches("reajyu.net", "reajyu.net"));
        assert!(host_matches("IMG.Reajyu.NET", "reajyu.net"));
        assert!(!host_matches("notreajyu.net", "reajyu.net"));
        assert!(!host_matches("", "reajyu.net"));
    }

    #[test]
    fn reads_dimensions_from_png_header() {
        assert_eq!(image_dimensions(&png(31, 17)), Some((31, 17)));
        assert_eq!(image_dimensions(b"GIF89"), None);
    }
}
