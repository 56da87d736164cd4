use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::types::{BrowserArg, Cli, FetchMode};

pub const DEFAULT_TARGET_URL: &str = "https://akibablog.blog.jp/";
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

const DEFAULT_VALID_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".webp", ".gif"];
const DEFAULT_EXCLUDE_PATTERNS: [&str; 6] = [
    "counter",
    "banner",
    "bunner",
    "icon",
    "button",
    "small_parts",
];
const DEFAULT_CONTENT_DOMAINS: [&str; 2] = ["livedoor.blogimg.jp", "akibablog.blog.jp"];
const DEFAULT_FRAME_DOMAINS: [&str; 1] = ["reajyu.net"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub target_url: String,
    pub mode: FetchMode,
    pub user_agent: String,
    pub page_timeout_secs: u64,
    pub image_timeout_secs: u64,
    pub min_image_size: u32,
    pub min_rendered_height: u32,
    pub valid_extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub content_domains: Vec<String>,
    pub frame_domains: Vec<String>,
    pub output_dir: PathBuf,
    pub log_file: PathBuf,
    pub pacing_ms: u64,
    pub dry_run: bool,
    pub dropbox: DropboxSettings,
    pub webdriver: WebDriverSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_url: DEFAULT_TARGET_URL.to_string(),
            mode: FetchMode::Static,
            user_agent: BROWSER_USER_AGENT.to_string(),
            page_timeout_secs: 30,
            image_timeout_secs: 30,
            min_image_size: 10,
            min_rendered_height: 250,
            valid_extensions: to_strings(&DEFAULT_VALID_EXTENSIONS),
            exclude_patterns: to_strings(&DEFAULT_EXCLUDE_PATTERNS),
            content_domains: to_strings(&DEFAULT_CONTENT_DOMAINS),
            frame_domains: to_strings(&DEFAULT_FRAME_DOMAINS),
            output_dir: PathBuf::from("downloaded_images"),
            log_file: PathBuf::from("imgrab.log"),
            pacing_ms: 1000,
            dry_run: false,
            dropbox: DropboxSettings::default(),
            webdriver: WebDriverSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropboxSettings {
    pub folder: String,
    pub api_base: String,
    pub content_base: String,
    pub timeout_secs: u64,
}

impl Default for DropboxSettings {
    fn default() -> Self {
        Self {
            folder: "/akiba-images".to_string(),
            api_base: "https://api.dropboxapi.com".to_string(),
            content_base: "https://content.dropboxapi.com".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverSettings {
    pub url: String,
    pub browser: BrowserArg,
    pub binary: Option<String>,
    pub autostart: bool,
    pub headless: bool,
    pub start_timeout_ms: u64,
    pub navigation_timeout_secs: u64,
    pub idle_budget_ms: u64,
    pub settle_ms: u64,
    pub max_frame_depth: usize,
}

impl Default for WebDriverSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:4444".to_string(),
            browser: BrowserArg::Chrome,
            binary: None,
            autostart: true,
            headless: true,
            start_timeout_ms: 12_000,
            navigation_timeout_secs: 60,
            idle_budget_ms: 15_000,
            settle_ms: 3_000,
            max_frame_depth: 3,
        }
    }
}

impl Settings {
    /// Config file first (when given), then explicit CLI flags on top.
    pub fn load(cli: &Cli) -> io::Result<Self> {
        let mut settings = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid config {}: {e}", path.display()),
            )
        })
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(url) = &cli.url {
            self.target_url = url.clone();
        }
        if let Some(mode) = cli.mode {
            self.mode = mode;
        }
        if let Some(dir) = &cli.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(file) = &cli.log_file {
            self.log_file = file.clone();
        }
        if let Some(ms) = cli.pacing_ms {
            self.pacing_ms = ms;
        }
        if let Some(px) = cli.min_image_size {
            self.min_image_size = px;
        }
        if let Some(px) = cli.min_rendered_height {
            self.min_rendered_height = px;
        }
        if let Some(folder) = &cli.dropbox_folder {
            self.dropbox.folder = folder.clone();
        }
        if let Some(url) = &cli.webdriver_url {
            self.webdriver.url = url.clone();
        }
        if let Some(browser) = cli.webdriver_browser {
            self.webdriver.browser = browser;
        }
        if let Some(binary) = &cli.webdriver_binary {
            self.webdriver.binary = Some(binary.clone());
        }
        if cli.no_webdriver_autostart {
            self.webdriver.autostart = false;
        }
        if cli.webdriver_headful {
            self.webdriver.headless = false;
        }
        if cli.dry_run {
            self.dry_run = true;
        }
    }

    fn validate(&self) -> io::Result<()> {
        let target = self.target_url()?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("target URL must be http/https: {}", self.target_url),
            ));
        }
        Url::parse(&self.webdriver.url).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid webdriver url {}: {e}", self.webdriver.url),
            )
        })?;
        Ok(())
    }

    pub fn target_url(&self) -> io::Result<Url> {
        Url::parse(&self.target_url).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid target url {}: {e}", self.target_url),
            )
        })
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

/// Dropbox credentials as handed to the process through its environment.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    AccessToken(String),
    Refresh {
        app_key: String,
        app_secret: String,
        refresh_token: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::AccessToken(_) => f.write_str("AccessToken(***)"),
            Credentials::Refresh { app_key, .. } => f
                .debug_struct("Refresh")
                .field("app_key", app_key)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// A complete refresh triple wins over a bare access token.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let (Some(app_key), Some(app_secret), Some(refresh_token)) = (
            read("DROPBOX_APP_KEY"),
            read("DROPBOX_APP_SECRET"),
            read("DROPBOX_REFRESH_TOKEN"),
        ) {
            return Some(Credentials::Refresh {
                app_key,
                app_secret,
                refresh_token,
            });
        }
        read("DROPBOX_ACCESS_TOKEN").map(Credentials::AccessToken)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::AccessToken(_) => "access token",
            Credentials::Refresh { .. } => "refresh token",
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_configuration() {
        let settings = Settings::default();
        assert_eq!(settings.min_image_size, 10);
        assert_eq!(settings.min_rendered_height, 250);
        assert_eq!(settings.pacing(), Duration::from_secs(1));
        assert_eq!(settings.dropbox.folder, "/akiba-images");
        assert!(settings.exclude_patterns.iter().any(|p| p == "small_parts"));
        assert!(settings.frame_domains.iter().any(|d| d == "reajyu.net"));
    }

    #[test]
    fn cli_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"target_url": "https://example.com/", "pacing_ms": 50, "mode": "rendered"}}"#
        )
        .unwrap();

        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            pacing_ms: Some(0),
            dry_run: true,
            ..Cli::default()
        };
        let settings = Settings::load(&cli).unwrap();
        assert_eq!(settings.target_url, "https://example.com/");
        assert_eq!(settings.mode, FetchMode::Rendered);
        assert_eq!(settings.pacing_ms, 0);
        assert!(settings.dry_run);
        assert_eq!(settings.min_rendered_height, 250);
    }

    #[test]
    fn rejects_non_http_target() {
        let cli = Cli {
            url: Some("ftp://example.com/".to_string()),
            ..Cli::default()
        };
        let err = Settings::load(&cli).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn refresh_triple_takes_precedence() {
        let creds = Credentials::from_lookup(lookup_from(&[
            ("DROPBOX_ACCESS_TOKEN", "short"),
            ("DROPBOX_APP_KEY", "key"),
            ("DROPBOX_APP_SECRET", "secret"),
            ("DROPBOX_REFRESH_TOKEN", "refresh"),
        ]));
        assert!(matches!(creds, Some(Credentials::Refresh { .. })));
    }

    #[test]
    fn incomplete_triple_falls_back_to_access_token() {
        let creds = Credentials::from_lookup(lookup_from(&[
            ("DROPBOX_ACCESS_TOKEN", "short"),
            ("DROPBOX_APP_KEY", "key"),
        ]));
        assert_eq!(creds, Some(Credentials::AccessToken("short".to_string())));
    }

    #[test]
    fn blank_credentials_are_absent() {
        let creds = Credentials::from_lookup(lookup_from(&[("DROPBOX_ACCESS_TOKEN", "  ")]));
        assert_eq!(creds, None);
    }

    #[test]
    fn debug_output_hides_tokens() {
        let creds = Credentials::AccessToken("sekrit".to_string());
        assert!(!format!("{creds:?}").contains("sekrit"));
    }
}
