use std::iter;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Parser, Clone, Default)]
#[command(
    name = "imgrab",
    version,
    about = "Fetch a page, keep the images worth keeping, store them locally or in Dropbox"
)]
pub struct Cli {
    #[arg(value_name = "URL")]
    pub url: Option<String>,

    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub mode: Option<FetchMode>,

    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long, value_name = "MS")]
    pub pacing_ms: Option<u64>,

    #[arg(long, value_name = "PX")]
    pub min_image_size: Option<u32>,

    #[arg(long, value_name = "PX")]
    pub min_rendered_height: Option<u32>,

    #[arg(long, value_name = "PATH")]
    pub dropbox_folder: Option<String>,

    #[arg(long, value_name = "URL")]
    pub webdriver_url: Option<String>,

    #[arg(long, value_enum)]
    pub webdriver_browser: Option<BrowserArg>,

    #[arg(long, value_name = "PATH")]
    pub webdriver_binary: Option<String>,

    #[arg(long, default_value_t = false)]
    pub no_webdriver_autostart: bool,

    #[arg(long, default_value_t = false)]
    pub webdriver_headful: bool,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    #[default]
    Static,
    Rendered,
}

impl FetchMode {
    pub fn label(self) -> &'static str {
        match self {
            FetchMode::Static => "static",
            FetchMode::Rendered => "rendered",
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserArg {
    #[default]
    Chrome,
    Firefox,
    Edge,
}

/// Which document of the page tree an image reference was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceContext {
    Root,
    Frame(Url),
}

impl SourceContext {
    pub fn label(&self) -> String {
        match self {
            SourceContext::Root => "root".to_string(),
            SourceContext::Frame(url) => format!("frame({url})"),
        }
    }
}

/// An `<img>` reference as the fetcher saw it, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub src: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl RawImage {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            width: None,
            height: None,
        }
    }

    pub fn with_size(src: impl Into<String>, width: Option<u32>, height: Option<u32>) -> Self {
        Self {
            src: src.into(),
            width,
            height,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub base_url: Url,
    pub source: SourceContext,
    pub images: Vec<RawImage>,
}

/// Root document plus every frame document, frames in the order the browser
/// reported them. Static fetches never have frames.
#[derive(Debug, Clone)]
pub struct DocumentTree {
    pub root: Document,
    pub frames: Vec<Document>,
}

impl DocumentTree {
    pub fn single(root: Document) -> Self {
        Self {
            root,
            frames: Vec::new(),
        }
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        iter::once(&self.root).chain(self.frames.iter())
    }

    pub fn image_count(&self) -> usize {
        self.documents().map(|doc| doc.images.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub url: Url,
    pub source: SourceContext,
    pub reported_width: Option<u32>,
    pub reported_height: Option<u32>,
}

/// A candidate that passed the pre-download rules of the active fetch mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedImage(ImageCandidate);

impl AcceptedImage {
    pub(crate) fn new(candidate: ImageCandidate) -> Self {
        Self(candidate)
    }

    pub fn url(&self) -> &Url {
        &self.0.url
    }

    pub fn candidate(&self) -> &ImageCandidate {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub url: Url,
    pub bytes: Vec<u8>,
    pub content_dimensions: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local(PathBuf),
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub filename: String,
    pub destination: Destination,
}

impl StoredArtifact {
    pub fn location(&self) -> String {
        match &self.destination {
            Destination::Local(path) => path.display().to_string(),
            Destination::Remote(path) => format!("dropbox:{path}"),
        }
    }
}
