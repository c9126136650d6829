//! Capability bridge
//!
//! The one structured namespace guest code can reach the host through,
//! visible as the global `tgp`. Every call is guest-synchronous and
//! host-async: the guest thread blocks on the runtime handle while the
//! host does the work, bounded by the execution deadline. Policy is
//! enforced here, never in the guest; a bridge is built per execution and
//! keeps its policy snapshot for its whole lifetime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::{KernelError, Result};
use crate::vfs::{normalize_path, path_within, Vfs};

/// Cap on accumulated guest log output per execution.
const LOG_CAPACITY_BYTES: usize = 64 * 1024;
/// Cap on a bridged fetch response body.
const FETCH_BODY_CAP_BYTES: usize = 5 * 1024 * 1024;

/// Host-injected capability (e.g. `exec_sql`): called with the guest's
/// arguments as a JSON array, resolves to a JSON value. The bridge
/// preserves the function itself; it never JSON-copies it.
pub type ExtensionFn = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<serde_json::Value, String>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct BridgeExtension {
    pub name: String,
    pub func: ExtensionFn,
}

/// Ordered log buffer shared between the guest thread and the host.
pub struct LogSink {
    lines: Vec<String>,
    bytes: usize,
    truncated: bool,
}

impl LogSink {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            bytes: 0,
            truncated: false,
        }
    }

    fn push(&mut self, line: String) {
        if self.truncated {
            return;
        }
        if self.bytes + line.len() > LOG_CAPACITY_BYTES {
            self.truncated = true;
            self.lines.push("[log output truncated]".to_string());
            return;
        }
        self.bytes += line.len();
        self.lines.push(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.clone()
    }
}

#[derive(Serialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(rename = "statusText")]
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(serde::Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FetchInit {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

pub struct Bridge {
    vfs: Arc<dyn Vfs>,
    allowed_write_dirs: Vec<String>,
    allowed_fetch_urls: Vec<String>,
    block_upward: bool,
    http: reqwest::Client,
    handle: tokio::runtime::Handle,
    deadline: Instant,
    logs: Arc<Mutex<LogSink>>,
    extensions: Vec<BridgeExtension>,
}

impl Bridge {
    /// Snapshot policy from config for one execution. Later config changes
    /// only affect later bridges.
    pub fn new(
        vfs: Arc<dyn Vfs>,
        config: &Config,
        extensions: Vec<BridgeExtension>,
        handle: tokio::runtime::Handle,
        deadline: Instant,
    ) -> Self {
        let allowed_write_dirs = config
            .fs
            .allowed_dirs
            .iter()
            .filter_map(|dir| normalize_path(dir, false).ok())
            .collect();
        Self {
            vfs,
            allowed_write_dirs,
            allowed_fetch_urls: config.allowed_fetch_urls.clone(),
            block_upward: config.fs.block_upward_traversal,
            http: reqwest::Client::new(),
            handle,
            deadline,
            logs: Arc::new(Mutex::new(LogSink::new())),
            extensions,
        }
    }

    pub fn logs_handle(&self) -> Arc<Mutex<LogSink>> {
        Arc::clone(&self.logs)
    }

    /// The execution deadline this bridge was built with; the sandbox uses
    /// the same instant for its interrupt handler.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn extension_names(&self) -> Vec<String> {
        self.extensions.iter().map(|e| e.name.clone()).collect()
    }

    /// Block the guest thread on host-side async work, bounded by the
    /// time left before the execution deadline.
    fn block_on<T>(
        &self,
        capability: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(cancelled(capability));
        }
        self.handle.block_on(async {
            match tokio::time::timeout(remaining, fut).await {
                Ok(result) => result,
                Err(_) => Err(cancelled(capability)),
            }
        })
    }

    pub fn read_file(&self, path: &str) -> Result<String> {
        self.block_on("read_file", self.vfs.read_file(path))
    }

    /// Stricter than the jail: the guest may only write inside
    /// `config.fs.allowedDirs`, wherever reads are permitted.
    pub fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let normalized = normalize_path(path, self.block_upward)?;
        let permitted = self
            .allowed_write_dirs
            .iter()
            .any(|dir| path_within(&normalized, dir));
        if !permitted {
            return Err(KernelError::SecurityViolation(format!(
                "Write access denied: {}",
                path
            )));
        }
        self.block_on("write_file", self.vfs.write_file(path, content))
    }

    pub fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        self.block_on("list_files", self.vfs.list_files(dir, false))
    }

    pub fn fetch(&self, url: &str, init_json: Option<String>) -> Result<FetchResponse> {
        let parsed = Url::parse(url).map_err(|e| {
            KernelError::SecurityViolation(format!("fetch blocked, invalid URL '{}': {}", url, e))
        })?;
        if parsed.scheme() != "https" {
            return Err(KernelError::SecurityViolation(format!(
                "fetch blocked for non-https URL: {}",
                url
            )));
        }
        if !self
            .allowed_fetch_urls
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
        {
            return Err(KernelError::SecurityViolation(format!(
                "network access denied: {}",
                url
            )));
        }

        let init: FetchInit = match init_json {
            None => FetchInit::default(),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| KernelError::BridgeDenied {
                capability: "fetch".to_string(),
                reason: format!("invalid init object: {}", e),
            })?,
        };

        let method_name = init
            .method
            .clone()
            .unwrap_or_else(|| "GET".to_string())
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method_name.as_bytes()).map_err(|_| {
            KernelError::BridgeDenied {
                capability: "fetch".to_string(),
                reason: format!("invalid method '{}'", method_name),
            }
        })?;

        let client = self.http.clone();
        let target = parsed.clone();
        debug!(url, method = %method, "bridge fetch");

        self.block_on("fetch", async move {
            let mut request = client.request(method, target);
            for (key, value) in &init.headers {
                request = request.header(key, value);
            }
            if let Some(body) = init.body {
                request = request.body(body);
            }

            let response = request.send().await.map_err(|e| KernelError::BridgeDenied {
                capability: "fetch".to_string(),
                reason: format!("request failed: {}", e),
            })?;

            let status = response.status();
            let mut headers = BTreeMap::new();
            for (name, value) in response.headers() {
                headers.insert(
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                );
            }

            let bytes = response.bytes().await.map_err(|e| KernelError::BridgeDenied {
                capability: "fetch".to_string(),
                reason: format!("body read failed: {}", e),
            })?;
            if bytes.len() > FETCH_BODY_CAP_BYTES {
                return Err(KernelError::BridgeDenied {
                    capability: "fetch".to_string(),
                    reason: format!("response exceeds {} byte cap", FETCH_BODY_CAP_BYTES),
                });
            }

            Ok(FetchResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                headers,
                body: String::from_utf8_lossy(&bytes).to_string(),
            })
        })
    }

    /// Append one pre-stringified log line, in call order.
    pub fn log(&self, line: String) {
        self.logs.lock().push(line);
    }

    pub fn call_extension(&self, name: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        let extension = self
            .extensions
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| KernelError::BridgeDenied {
                capability: name.to_string(),
                reason: "no such capability".to_string(),
            })?;

        let fut = (extension.func)(args);
        self.block_on(name, async move {
            fut.await.map_err(|reason| KernelError::BridgeDenied {
                capability: name.to_string(),
                reason,
            })
        })
    }
}

fn cancelled(capability: &str) -> KernelError {
    KernelError::BridgeDenied {
        capability: capability.to_string(),
        reason: "Cancelled: execution deadline exceeded".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::vfs::MemoryVfs;
    use std::time::Duration;

    fn test_config(allowed_fetch: Vec<String>) -> Config {
        let mut config = Config::from_json(
            r#"{
                "rootDir": "/tmp/bridge-test",
                "git": { "repo": "a/b", "auth": { "token": "t" } }
            }"#,
        )
        .expect("config");
        config.allowed_fetch_urls = allowed_fetch;
        config
    }

    fn bridge(config: &Config) -> (Arc<MemoryVfs>, Bridge) {
        let vfs = Arc::new(MemoryVfs::new(true));
        let bridge = Bridge::new(
            vfs.clone(),
            config,
            Vec::new(),
            tokio::runtime::Handle::current(),
            Instant::now() + Duration::from_secs(5),
        );
        (vfs, bridge)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_outside_allowed_dirs_is_denied_and_creates_nothing() {
        let config = test_config(Vec::new());
        let (vfs, bridge) = bridge(&config);

        let result = tokio::task::spawn_blocking(move || {
            let denied = bridge.write_file("secrets/creds.txt", "boom");
            let allowed = bridge.write_file("tools/out.ts", "export default 1;");
            (denied, allowed)
        })
        .await
        .expect("join");

        let denied = result.0.expect_err("must deny outside tools/");
        assert!(denied.to_string().contains("Write access denied"));
        result.1.expect("tools/ write allowed");

        assert!(!vfs.exists("secrets/creds.txt").await.expect("exists"));
        assert!(vfs.exists("tools/out.ts").await.expect("exists"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_denied_when_allow_list_empty_or_not_matching() {
        let config = test_config(vec!["https://api.example.com/".to_string()]);
        let (_vfs, bridge) = bridge(&config);

        let results = tokio::task::spawn_blocking(move || {
            (
                bridge.fetch("http://api.example.com/x", None).err(),
                bridge.fetch("https://evil.example.com/x", None).err(),
            )
        })
        .await
        .expect("join");

        let scheme_err = results.0.expect("http must be blocked");
        assert!(scheme_err.to_string().contains("Security Violation"));
        let host_err = results.1.expect("unlisted prefix must be blocked");
        assert!(host_err.to_string().contains("network access denied"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn logs_preserve_order_and_cap() {
        let config = test_config(Vec::new());
        let (_vfs, bridge) = bridge(&config);
        let logs = bridge.logs_handle();

        bridge.log("first".to_string());
        bridge.log("second".to_string());
        let snapshot = logs.lock().snapshot();
        assert_eq!(snapshot, vec!["first".to_string(), "second".to_string()]);

        bridge.log("x".repeat(LOG_CAPACITY_BYTES));
        let capped = logs.lock().snapshot();
        assert_eq!(capped.last().map(String::as_str), Some("[log output truncated]"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_extension_is_a_bridge_denial() {
        let config = test_config(Vec::new());
        let (_vfs, bridge) = bridge(&config);

        let err = tokio::task::spawn_blocking(move || {
            bridge.call_extension("exec_sql", serde_json::json!([]))
        })
        .await
        .expect("join")
        .expect_err("unknown capability");
        assert!(matches!(err, KernelError::BridgeDenied { .. }));
    }
}
