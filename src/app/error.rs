use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("webdriver unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("rendering {url} failed: {source}")]
    Render {
        url: String,
        #[source]
        source: WebDriverError,
    },
}

#[derive(Debug, Error)]
pub enum WebDriverError {
    #[error("{context} request failed: {source}")]
    Request {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{context} HTTP {status}: {body}")]
    Status {
        context: &'static str,
        status: u16,
        body: String,
    },

    #[error("{context} webdriver error {error}: {message}")]
    Protocol {
        context: &'static str,
        error: String,
        message: String,
    },

    #[error("{context} parse failed: {source}")]
    Parse {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Driver(String),
}

#[derive(Debug, Error)]
#[error("frame {frame} evaluation failed: {source}")]
pub struct FrameEvaluationError {
    pub frame: String,
    #[source]
    pub source: WebDriverError,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download of {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("download of {url} returned an empty body")]
    Empty { url: String },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("writing {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("upload to {path} failed: {source}")]
    Upload {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("upload to {path} returned HTTP {status}: {body}")]
    Rejected {
        path: String,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{context} request failed: {source}")]
    Request {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{context} HTTP {status}: {body}")]
    Status {
        context: &'static str,
        status: u16,
        body: String,
    },

    #[error("{context} response invalid: {source}")]
    Parse {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// The two ways a run ends before the per-item loop starts.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("page fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("no image candidates left after {stage}")]
    ExtractionEmpty { stage: &'static str },
}
