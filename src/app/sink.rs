use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::config::{Credentials, DropboxSettings, Settings};
use super::error::{AuthError, PersistError};
use super::types::{Destination, StoredArtifact};

pub struct LocalSink {
    dir: PathBuf,
}

impl LocalSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Same filename twice overwrites; the directory is created on demand.
    pub fn persist(&self, bytes: &[u8], filename: &str) -> Result<StoredArtifact, PersistError> {
        fs::create_dir_all(&self.dir).map_err(|source| PersistError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(filename);
        fs::write(&path, bytes).map_err(|source| PersistError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(StoredArtifact {
            filename: filename.to_string(),
            destination: Destination::Local(path),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub account_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    account_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<AccountName>,
}

#[derive(Debug, Deserialize)]
struct AccountName {
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct DropboxSink {
    client: reqwest::Client,
    access_token: String,
    folder: String,
    api_base: String,
    content_base: String,
}

impl DropboxSink {
    /// Resolves an access token (minting one from a refresh token when
    /// needed) and confirms it against the account endpoint.
    pub async fn connect(
        settings: &DropboxSettings,
        credentials: &Credentials,
    ) -> Result<(Self, AccountIdentity), AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|source| AuthError::Request {
                context: "dropbox client build",
                source,
            })?;
        let access_token = match credentials {
            Credentials::AccessToken(token) => token.clone(),
            Credentials::Refresh {
                app_key,
                app_secret,
                refresh_token,
            } => {
                mint_access_token(
                    &client,
                    &settings.api_base,
                    app_key,
                    app_secret,
                    refresh_token,
                )
                .await?
            }
        };
        let sink = Self {
            client,
            access_token,
            folder: settings.folder.clone(),
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            content_base: settings.content_base.trim_end_matches('/').to_string(),
        };
        let identity = sink.authenticate().await?;
        Ok((sink, identity))
    }

    pub async fn authenticate(&self) -> Result<AccountIdentity, AuthError> {
        const CONTEXT: &str = "dropbox account check";
        let res = self
            .client
            .post(format!("{}/2/users/get_current_account", self.api_base))
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|source| AuthError::Request {
                context: CONTEXT,
                source,
            })?;
        let status = res.status();
        let body = res.text().await.map_err(|source| AuthError::Request {
            context: CONTEXT,
            source,
        })?;
        if !status.is_success() {
            return Err(AuthError::Status {
                context: CONTEXT,
                status: status.as_u16(),
                body,
            });
        }
        let account: AccountResponse =
            serde_json::from_str(&body).map_err(|source| AuthError::Parse {
                context: CONTEXT,
                source,
            })?;
        Ok(AccountIdentity {
            account_id: account.account_id,
            email: account.email,
            display_name: account.name.and_then(|n| n.display_name),
        })
    }

    pub fn remote_path(&self, filename: &str) -> String {
        format!("{}/{filename}", self.folder.trim_end_matches('/'))
    }

    /// Overwrites on conflict and asks Dropbox not to notify clients.
    pub async fn upload(&self, bytes: &[u8], path: &str) -> Result<(), PersistError> {
        let arg = json!({
            "path": path,
            "mode": "overwrite",
            "autorename": false,
            "mute": true
        });
        let res = self
            .client
            .post(format!("{}/2/files/upload", self.content_base))
            .header(AUTHORIZATION, self.bearer())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Dropbox-API-Arg", header_safe_json(&arg.to_string()))
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|source| PersistError::Upload {
                path: path.to_string(),
                source,
            })?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(PersistError::Rejected {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    pub async fn persist(
        &self,
        bytes: &[u8],
        filename: &str,
    ) -> Result<StoredArtifact, PersistError> {
        let path = self.remote_path(filename);
        self.upload(bytes, &path).await?;
        Ok(StoredArtifact {
            filename: filename.to_string(),
            destination: Destination::Remote(path),
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

async fn mint_access_token(
    client: &reqwest::Client,
    api_base: &str,
    app_key: &str,
    app_secret: &str,
    refresh_token: &str,
) -> Result<String, AuthError> {
    const CONTEXT: &str = "dropbox token refresh";
    let res = client
        .post(format!("{}/oauth2/token", api_base.trim_end_matches('/')))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", app_key),
            ("client_secret", app_secret),
        ])
        .send()
        .await
        .map_err(|source| AuthError::Request {
            context: CONTEXT,
            source,
        })?;
    let status = res.status();
    let body = res.text().await.map_err(|source| AuthError::Request {
        context: CONTEXT,
        source,
    })?;
    if !status.is_success() {
        return Err(AuthError::Status {
            context: CONTEXT,
            status: status.as_u16(),
            body,
        });
    }
    let token: TokenResponse = serde_json::from_str(&body).map_err(|source| AuthError::Parse {
        context: CONTEXT,
        source,
    })?;
    info!(
        "minted short-lived dropbox token (expires in {}s)",
        token.expires_in.unwrap_or_default()
    );
    Ok(token.access_token)
}

// HTTP header values must stay ASCII; Dropbox accepts \uXXXX escapes.
fn header_safe_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

/// Where accepted images end up for this run.
pub enum Sink {
    Local(LocalSink),
    Dropbox(DropboxSink),
}

impl Sink {
    /// Dropbox when credentials are present and valid, local disk otherwise.
    /// Never fails: an auth problem only downgrades the backend.
    pub async fn select(settings: &Settings, credentials: Option<Credentials>) -> Self {
        let local = || Sink::Local(LocalSink::new(settings.output_dir.clone()));
        let Some(credentials) = credentials else {
            warn!(
                "no Dropbox credentials in environment; saving to {}",
                settings.output_dir.display()
            );
            return local();
        };
        match DropboxSink::connect(&settings.dropbox, &credentials).await {
            Ok((sink, identity)) => {
                info!(
                    "dropbox authenticated via {} as {} <{}> ({})",
                    credentials.kind(),
                    identity.display_name.as_deref().unwrap_or("unknown"),
                    identity.email.as_deref().unwrap_or("no email"),
                    identity.account_id
                );
                Sink::Dropbox(sink)
            }
            Err(err) => {
                warn!(
                    "dropbox authentication failed: {err}; saving to {} for this run",
                    settings.output_dir.display()
                );
                local()
            }
        }
    }

    pub async fn persist(
        &self,
        bytes: &[u8],
        filename: &str,
    ) -> Result<StoredArtifact, PersistError> {
        match self {
            Sink::Local(sink) => sink.persist(bytes, filename),
            Sink::Dropbox(sink) => sink.persist(bytes, filename).await,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Sink::Local(sink) => format!("local directory {}", sink.dir().display()),
            Sink::Dropbox(sink) => format!("dropbox folder {}", sink.folder),
        }
    }
}
