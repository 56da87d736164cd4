use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use super::config::WebDriverSettings;
use super::error::{FetchError, FrameEvaluationError, WebDriverError};
use super::types::{BrowserArg, Document, DocumentTree, RawImage, SourceContext};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const FRAME_SELECTOR: &str = "iframe, frame";
const MAX_FRAMES: usize = 64;
const IDLE_POLL: Duration = Duration::from_millis(500);
const IDLE_STABLE_POLLS: usize = 2;

const DOCUMENT_IMAGES_SCRIPT: &str = r#"
    return {
        href: window.location.href || "",
        base: document.baseURI || "",
        images: Array.from(document.images).map(img => ({
            src: img.getAttribute('src') || "",
            width: img.naturalWidth || img.width || 0,
            height: img.naturalHeight || img.height || 0
        }))
    };
"#;

const IDLE_PROBE_SCRIPT: &str = r#"
    return {
        ready: document.readyState || "",
        resources: performance.getEntriesByType
            ? performance.getEntriesByType('resource').length
            : 0
    };
"#;

/// Driver process we spawned ourselves. Killed when dropped.
#[derive(Debug)]
struct DriverProcess {
    binary: String,
    child: Child,
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        debug!("stopped webdriver {}", self.binary);
    }
}

pub struct RenderedFetcher {
    settings: WebDriverSettings,
}

impl RenderedFetcher {
    pub fn new(settings: WebDriverSettings) -> Self {
        Self { settings }
    }

    pub async fn fetch(&self, target: &Url) -> Result<DocumentTree, FetchError> {
        let (endpoint, _driver) = ensure_webdriver_ready(&self.settings)
            .await
            .map_err(|e| FetchError::BrowserUnavailable(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                self.settings.navigation_timeout_secs.saturating_add(30),
            ))
            .build()
            .map_err(|e| FetchError::BrowserUnavailable(format!("client build failed: {e}")))?;

        let caps = webdriver_capabilities(self.settings.browser, self.settings.headless);
        let session = WebDriverSession::create(&client, &endpoint, &caps)
            .await
            .map_err(|e| FetchError::BrowserUnavailable(e.to_string()))?;
        info!(
            "browser session {} opened ({:?}, headless={})",
            session.id, self.settings.browser, self.settings.headless
        );

        let rendered = self
            .render(&session, target)
            .await
            .map_err(|source| FetchError::Render {
                url: target.to_string(),
                source,
            });
        session.close().await;
        rendered
    }

    async fn render(
        &self,
        session: &WebDriverSession,
        target: &Url,
    ) -> Result<DocumentTree, WebDriverError> {
        session
            .set_page_load_timeout(Duration::from_secs(self.settings.navigation_timeout_secs))
            .await?;
        info!("navigating to {target}");
        session.navigate(target).await?;
        self.wait_for_network_idle(session).await;
        if self.settings.settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.settle_ms)).await;
        }

        let root = root_document(session.execute(DOCUMENT_IMAGES_SCRIPT).await?, target)?;
        info!("root document: {} <img> elements", root.images.len());
        let frames = self.collect_frames(session, target).await;
        info!("evaluated {} frame documents", frames.len());
        Ok(DocumentTree { root, frames })
    }

    async fn wait_for_network_idle(&self, session: &WebDriverSession) {
        let deadline = Instant::now() + Duration::from_millis(self.settings.idle_budget_ms);
        let mut last_count = None;
        let mut stable = 0;
        while Instant::now() < deadline {
            match session.execute(IDLE_PROBE_SCRIPT).await {
                Ok(probe) => {
                    let complete = probe.get("ready").and_then(Value::as_str) == Some("complete");
                    let count = probe.get("resources").and_then(Value::as_u64);
                    if complete && count.is_some() && count == last_count {
                        stable += 1;
                        if stable >= IDLE_STABLE_POLLS {
                            debug!("network idle after {:?} resources", count);
                            return;
                        }
                    } else {
                        stable = 0;
                    }
                    last_count = count;
                }
                Err(err) => {
                    debug!("idle probe failed, continuing: {err}");
                    return;
                }
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        debug!("network idle budget exhausted");
    }

    /// Depth-first, document order. Each frame is re-entered from the top by
    /// index path since element references do not survive context switches.
    async fn collect_frames(&self, session: &WebDriverSession, target: &Url) -> Vec<Document> {
        let top_level = match session.switch_to_top().await {
            Ok(()) => session.frame_elements().await.map(|f| f.len()),
            Err(err) => Err(err),
        };
        let top_level = match top_level {
            Ok(count) => count,
            Err(err) => {
                warn!("frame enumeration failed: {err}");
                return Vec::new();
            }
        };

        let mut pending = (0..top_level).rev().map(|i| vec![i]).collect::<Vec<_>>();
        let mut documents = Vec::new();
        let mut visited = 0;
        while let Some(path) = pending.pop() {
            if visited >= MAX_FRAMES {
                warn!("frame limit {MAX_FRAMES} reached, ignoring the rest");
                break;
            }
            visited += 1;
            match evaluate_frame(session, &path, target).await {
                Ok((document, children)) => {
                    debug!(
                        "frame {} ({}): {} <img> elements",
                        path_label(&path),
                        document.source.label(),
                        document.images.len()
                    );
                    if path.len() < self.settings.max_frame_depth {
                        for i in (0..children).rev() {
                            let mut child = path.clone();
                            child.push(i);
                            pending.push(child);
                        }
                    }
                    documents.push(document);
                }
                Err(err) => warn!("{err}; skipping frame"),
            }
        }
        if let Err(err) = session.switch_to_top().await {
            debug!("switch back to top document failed: {err}");
        }
        documents
    }
}

async fn evaluate_frame(
    session: &WebDriverSession,
    path: &[usize],
    fallback_base: &Url,
) -> Result<(Document, usize), FrameEvaluationError> {
    let evaluated = async {
        session.switch_to_top().await?;
        for &index in path {
            let frames = session.frame_elements().await?;
            let element = frames
                .get(index)
                .ok_or_else(|| WebDriverError::Driver(format!("frame #{index} disappeared")))?;
            session.switch_to_frame(element).await?;
        }
        let value = session.execute(DOCUMENT_IMAGES_SCRIPT).await?;
        let children = session.frame_elements().await.map(|f| f.len()).unwrap_or(0);
        let document = frame_document(value, fallback_base)?;
        Ok::<_, WebDriverError>((document, children))
    };
    evaluated.await.map_err(|source| FrameEvaluationError {
        frame: path_label(path),
        source,
    })
}

fn path_label(path: &[usize]) -> String {
    let parts = path.iter().map(|i| i.to_string()).collect::<Vec<_>>();
    format!("#{}", parts.join("."))
}

#[derive(Debug, Deserialize)]
struct EvaluatedDocument {
    #[serde(default)]
    href: String,
    #[serde(default)]
    base: String,
    #[serde(default)]
    images: Vec<EvaluatedImage>,
}

#[derive(Debug, Deserialize)]
struct EvaluatedImage {
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    width: Option<f64>,
    #[serde(default)]
    height: Option<f64>,
}

impl EvaluatedDocument {
    fn parse(value: Value, context: &'static str) -> Result<Self, WebDriverError> {
        serde_json::from_value(value).map_err(|source| WebDriverError::Parse { context, source })
    }

    fn raw_images(&self) -> Vec<RawImage> {
        self.images
            .iter()
            .map(|img| {
                RawImage::with_size(
                    img.src.clone().unwrap_or_default(),
                    reported_dimension(img.width),
                    reported_dimension(img.height),
                )
            })
            .collect()
    }
}

// Zero means the browser has not decoded the image yet.
fn reported_dimension(value: Option<f64>) -> Option<u32> {
    value
        .filter(|v| v.is_finite() && *v >= 1.0)
        .map(|v| v.round().min(u32::MAX as f64) as u32)
}

fn root_document(value: Value, target: &Url) -> Result<Document, WebDriverError> {
    let evaluated = EvaluatedDocument::parse(value, "root evaluation")?;
    Ok(Document {
        base_url: target.clone(),
        source: SourceContext::Root,
        images: evaluated.raw_images(),
    })
}

fn frame_document(value: Value, fallback_base: &Url) -> Result<Document, WebDriverError> {
    let evaluated = EvaluatedDocument::parse(value, "frame evaluation")?;
    let base = Url::parse(&evaluated.base).ok();
    let href = Url::parse(&evaluated.href)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"));
    let base_url = base
        .clone()
        .or_else(|| href.clone())
        .unwrap_or_else(|| fallback_base.clone());
    let frame_url = href.unwrap_or_else(|| base_url.clone());
    Ok(Document {
        base_url,
        source: SourceContext::Frame(frame_url),
        images: evaluated.raw_images(),
    })
}

/// A live WebDriver session. `close` ends it; if that never runs, drop
/// schedules the DELETE on the current runtime.
struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    id: String,
    closed: bool,
}

impl WebDriverSession {
    async fn create(
        client: &reqwest::Client,
        endpoint: &str,
        capabilities: &Value,
    ) -> Result<Self, WebDriverError> {
        let base = endpoint.trim_end_matches('/').to_string();
        let response = send_command(
            client,
            Method::POST,
            &format!("{base}/session"),
            Some(capabilities),
            "session create",
        )
        .await?;
        let id = response
            .pointer("/value/sessionId")
            .and_then(Value::as_str)
            .or_else(|| response.pointer("/sessionId").and_then(Value::as_str))
            .map(|s| s.to_string())
            .ok_or_else(|| {
                WebDriverError::Driver(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&response.to_string(), 220)
                ))
            })?;
        Ok(Self {
            client: client.clone(),
            base,
            id,
            closed: false,
        })
    }

    fn session_url(&self) -> String {
        format!("{}/session/{}", self.base, self.id)
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        context: &'static str,
    ) -> Result<Value, WebDriverError> {
        let url = format!("{}{}", self.session_url(), path);
        let mut response = send_command(&self.client, method, &url, body, context).await?;
        Ok(response
            .get_mut("value")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn set_page_load_timeout(&self, timeout: Duration) -> Result<(), WebDriverError> {
        let body = json!({ "pageLoad": timeout.as_millis() as u64 });
        self.command(Method::POST, "/timeouts", Some(&body), "set timeouts")
            .await
            .map(|_| ())
    }

    async fn navigate(&self, url: &Url) -> Result<(), WebDriverError> {
        let body = json!({ "url": url.as_str() });
        self.command(Method::POST, "/url", Some(&body), "navigate")
            .await
            .map(|_| ())
    }

    async fn execute(&self, script: &str) -> Result<Value, WebDriverError> {
        let body = json!({ "script": script, "args": [] });
        self.command(Method::POST, "/execute/sync", Some(&body), "execute script")
            .await
    }

    async fn frame_elements(&self) -> Result<Vec<Value>, WebDriverError> {
        let body = json!({ "using": "css selector", "value": FRAME_SELECTOR });
        let value = self
            .command(Method::POST, "/elements", Some(&body), "find frames")
            .await?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.get(ELEMENT_KEY).is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn switch_to_top(&self) -> Result<(), WebDriverError> {
        let body = json!({ "id": null });
        self.command(Method::POST, "/frame", Some(&body), "switch to top")
            .await
            .map(|_| ())
    }

    async fn switch_to_frame(&self, element: &Value) -> Result<(), WebDriverError> {
        let body = json!({ "id": element });
        self.command(Method::POST, "/frame", Some(&body), "switch to frame")
            .await
            .map(|_| ())
    }

    async fn close(mut self) {
        self.closed = true;
        match self.client.delete(self.session_url()).send().await {
            Ok(_) => debug!("browser session {} closed", self.id),
            Err(err) => warn!("closing browser session {} failed: {err}", self.id),
        }
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        let url = self.session_url();
        handle.spawn(async move {
            let _ = client.delete(url).send().await;
        });
    }
}

async fn send_command(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<&Value>,
    context: &'static str,
) -> Result<Value, WebDriverError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(body);
    }
    let res = request
        .send()
        .await
        .map_err(|source| WebDriverError::Request { context, source })?;
    let status = res.status();
    let text = res
        .text()
        .await
        .map_err(|source| WebDriverError::Request { context, source })?;

    let parsed = serde_json::from_str::<Value>(&text);
    if let Ok(value) = &parsed {
        if let Some(error) = value.pointer("/value/error").and_then(Value::as_str) {
            let message = value
                .pointer("/value/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown webdriver error");
            return Err(WebDriverError::Protocol {
                context,
                error: error.to_string(),
                message: truncate_for_log(message, 240),
            });
        }
    }
    if !status.is_success() {
        return Err(WebDriverError::Status {
            context,
            status: status.as_u16(),
            body: truncate_for_log(&text, 240),
        });
    }
    parsed.map_err(|source| WebDriverError::Parse { context, source })
}

async fn ensure_webdriver_ready(
    settings: &WebDriverSettings,
) -> Result<(String, Option<DriverProcess>), WebDriverError> {
    let requested = normalize_local_webdriver_endpoint(&settings.url);
    if endpoint_reachable(&requested).await {
        info!("webdriver endpoint reachable at {requested}");
        return Ok((requested, None));
    }
    if !settings.autostart {
        return Err(WebDriverError::Driver(format!(
            "endpoint {requested} unreachable and autostart is disabled"
        )));
    }
    if !is_local_endpoint(&requested) {
        return Err(WebDriverError::Driver(format!(
            "endpoint {requested} unreachable; autostart only supports localhost endpoints"
        )));
    }

    let port = find_free_local_port()?;
    let process = start_webdriver(settings, port).await?;
    let endpoint = format!("http://127.0.0.1:{port}");
    info!("webdriver {} autostarted at {endpoint}", process.binary);
    Ok((endpoint, Some(process)))
}

async fn start_webdriver(
    settings: &WebDriverSettings,
    port: u16,
) -> Result<DriverProcess, WebDriverError> {
    let binary = settings
        .binary
        .clone()
        .unwrap_or_else(|| default_driver_binary(settings.browser).to_string());
    let endpoint = format!("http://127.0.0.1:{port}");

    let mut cmd = Command::new(&binary);
    configure_webdriver_command(&mut cmd, &binary, port);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd
        .spawn()
        .map_err(|e| WebDriverError::Driver(format!("failed to spawn {binary}: {e}")))?;
    let mut process = DriverProcess {
        binary: binary.clone(),
        child,
    };

    let steps = (settings.start_timeout_ms / 200).max(1);
    for _ in 0..steps {
        if endpoint_reachable(&endpoint).await {
            return Ok(process);
        }
        if let Ok(Some(status)) = process.child.try_wait() {
            return Err(WebDriverError::Driver(format!(
                "{binary} exited early with status {status}"
            )));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Err(WebDriverError::Driver(format!(
        "{binary} did not become ready within {} ms",
        settings.start_timeout_ms
    )))
}

fn default_driver_binary(browser: BrowserArg) -> &'static str {
    match browser {
        BrowserArg::Chrome => "chromedriver",
        BrowserArg::Firefox => "geckodriver",
        BrowserArg::Edge => "msedgedriver",
    }
}

fn configure_webdriver_command(cmd: &mut Command, bin: &str, port: u16) {
    let lower = bin.to_ascii_lowercase();
    if lower.contains("geckodriver") {
        cmd.arg("--port").arg(port.to_string());
        return;
    }
    cmd.arg(format!("--port={port}"));
    if lower.contains("chromedriver") {
        cmd.arg("--log-level=SEVERE");
    }
}

// DNS and connect block, so the check runs on the blocking pool.
async fn endpoint_reachable(endpoint: &str) -> bool {
    let endpoint = endpoint.to_string();
    tokio::task::spawn_blocking(move || webdriver_reachable(&endpoint))
        .await
        .unwrap_or(false)
}

fn is_local_endpoint(endpoint: &str) -> bool {
    Url::parse(endpoint)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.to_ascii_lowercase()))
        .is_some_and(|host| host == "localhost" || host == "127.0.0.1")
}

fn webdriver_reachable(endpoint: &str) -> bool {
    let Ok(parsed) = Url::parse(endpoint) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(4444);
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

fn normalize_local_webdriver_endpoint(endpoint: &str) -> String {
    let Ok(url) = Url::parse(endpoint) else {
        return endpoint.to_string();
    };
    if !is_local_endpoint(endpoint) {
        return endpoint.trim_end_matches('/').to_string();
    }
    let scheme = url.scheme();
    let port = url.port_or_known_default().unwrap_or(4444);
    format!("{scheme}://127.0.0.1:{port}")
}

fn find_free_local_port() -> Result<u16, WebDriverError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| WebDriverError::Driver(format!("free port bind failed: {e}")))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| WebDriverError::Driver(format!("local addr failed: {e}")))
}

fn webdriver_capabilities(browser: BrowserArg, headless: bool) -> Value {
    match browser {
        BrowserArg::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "normal",
                        "moz:firefoxOptions": { "args": args }
                    }
                }
            })
        }
        BrowserArg::Edge => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push("--window-size=1400,1200".to_string());
            args.push("--disable-gpu".to_string());
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "MicrosoftEdge",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "normal",
                        "ms:edgeOptions": { "args": args }
                    }
                }
            })
        }
        BrowserArg::Chrome => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push("--window-size=1400,1200".to_string());
            args.push("--disable-gpu".to_string());
            args.push("--disable-dev-shm-usage".to_string());
            args.push("--no-first-run".to_string());
            args.push("--no-default-browser-check".to_string());
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "normal",
                        "goog:chromeOptions": { "args": args }
                    }
                }
            })
        }
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}
