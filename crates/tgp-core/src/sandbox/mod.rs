//! Isolated execution sandbox
//!
//! One QuickJS runtime per execution: memory-capped, wall-clock-capped,
//! disposed unconditionally when the run finishes. Guest code reaches the
//! host only through the bridge namespace and the module resolver; results
//! come back as pure JSON.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::function::{Func, Opt};
use rquickjs::{Context, Ctx, Exception, Function, Object, Runtime, Value};
use serde::Serialize;
use tracing::debug;

use crate::error::{KernelError, Result};
use crate::vfs::Vfs;

pub mod bridge;
mod convert;
mod resolver;
pub mod transpile;

pub use bridge::{Bridge, BridgeExtension, ExtensionFn};

use convert::{exception_name, exception_text};
use resolver::ModuleResolver;

/// Watchdog slack on top of the guest deadline; keeps the host answer
/// within the promised envelope even if the interrupt lags.
const WATCHDOG_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub memory_limit_bytes: usize,
    pub timeout: Duration,
}

impl SandboxLimits {
    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// What the agent sees from `exec_tool`. Exactly one of `result`/`error`
/// is populated; `logs` is always present.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn ok(result: serde_json::Value, logs: Vec<String>) -> Self {
        Self {
            success: true,
            result: Some(result),
            logs,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            success: false,
            result: None,
            logs,
            error: Some(error.into()),
        }
    }
}

pub struct Sandbox {
    vfs: Arc<dyn Vfs>,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(vfs: Arc<dyn Vfs>, limits: SandboxLimits) -> Self {
        Self { vfs, limits }
    }

    /// Compile and run one tool to completion. Execution failures are
    /// folded into the returned `ExecutionResult`; this never throws them.
    pub async fn compile_and_run(
        &self,
        entry_path: &str,
        source: &str,
        args: Option<serde_json::Value>,
        bridge: Bridge,
    ) -> ExecutionResult {
        let logs = bridge.logs_handle();
        let vfs = Arc::clone(&self.vfs);
        let limits = self.limits;
        let entry = entry_path.to_string();
        let source = source.to_string();
        let bridge = Arc::new(bridge);

        let task =
            tokio::task::spawn_blocking(move || run_guest(vfs, limits, entry, source, args, bridge));

        let outcome = match tokio::time::timeout(limits.timeout + WATCHDOG_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(KernelError::InternalSandboxError(format!(
                "guest worker panicked: {}",
                join_error
            ))),
            Err(_) => Err(KernelError::Timeout(limits.timeout_ms())),
        };

        let log_lines = logs.lock().snapshot();
        match outcome {
            Ok(value) => ExecutionResult::ok(value, log_lines),
            Err(error) => {
                debug!(path = %entry_path, error = %error, "execution failed");
                ExecutionResult::failed(error.execution_message(), log_lines)
            }
        }
    }
}

fn run_guest(
    vfs: Arc<dyn Vfs>,
    limits: SandboxLimits,
    entry_path: String,
    source: String,
    args: Option<serde_json::Value>,
    bridge: Arc<Bridge>,
) -> Result<serde_json::Value> {
    let code = transpile::strip_types(&entry_path, &source)?;

    let runtime = Runtime::new().map_err(|e| {
        KernelError::InternalSandboxError(format!("guest runtime init failed: {}", e))
    })?;
    runtime.set_memory_limit(limits.memory_limit_bytes);

    let deadline = bridge.deadline();
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

    let context = Context::full(&runtime).map_err(|e| {
        KernelError::InternalSandboxError(format!("guest context init failed: {}", e))
    })?;

    // Phase 1: bridge + shim in, entry module evaluated, default export
    // invoked, outcome handed to the capture slot.
    context.with(|ctx| -> Result<()> {
        install_bridge(&ctx, &bridge).map_err(|e| classify(&ctx, e, deadline, &limits))?;

        let resolver = ModuleResolver::new(Arc::clone(&vfs));
        let exports = resolver
            .evaluate_module(&ctx, &entry_path, &code)
            .map_err(|e| classify(&ctx, e, deadline, &limits))?;

        let target = entry_target(&exports).map_err(|e| classify(&ctx, e, deadline, &limits))?;

        let outcome: Value = match target.as_function() {
            Some(function) => {
                let call_args = match &args {
                    Some(json) => convert::json_to_js(&ctx, json)
                        .map_err(|e| classify(&ctx, e, deadline, &limits))?,
                    None => Value::new_undefined(ctx.clone()),
                };
                function
                    .call((call_args,))
                    .map_err(|e| classify(&ctx, e, deadline, &limits))?
            }
            None => target,
        };

        let capture: Function = ctx
            .globals()
            .get("__tgp_capture")
            .map_err(|e| classify(&ctx, e, deadline, &limits))?;
        capture
            .call::<_, ()>((outcome,))
            .map_err(|e| classify(&ctx, e, deadline, &limits))
    })?;

    // Phase 2: drive microtasks until the outcome settles. All bridge work
    // is guest-synchronous, so a drained job queue with a pending slot
    // means a promise that will never settle.
    loop {
        let state = context.with(|ctx| -> Result<String> {
            slot(&ctx)
                .and_then(|slot| slot.get::<_, String>("state"))
                .map_err(|e| classify(&ctx, e, deadline, &limits))
        })?;
        if state != "pending" {
            break;
        }
        if Instant::now() >= deadline {
            return Err(KernelError::Timeout(limits.timeout_ms()));
        }
        match runtime.execute_pending_job() {
            Ok(true) => {}
            Ok(false) => {
                return Err(KernelError::GuestThrew(
                    "tool returned a promise that never settles".to_string(),
                ))
            }
            // A job threw; rejections land in the slot through the capture
            // handler, so keep draining.
            Err(_) => {}
        }
    }

    // Phase 3: unwrap a pure-data copy.
    context.with(|ctx| -> Result<serde_json::Value> {
        let slot = slot(&ctx).map_err(|e| classify(&ctx, e, deadline, &limits))?;
        let state: String = slot
            .get("state")
            .map_err(|e| classify(&ctx, e, deadline, &limits))?;
        if state == "rejected" {
            let error: Value = slot
                .get("error")
                .map_err(|e| classify(&ctx, e, deadline, &limits))?;
            return Err(KernelError::GuestThrew(exception_text(&error)));
        }
        let value: Value = slot
            .get("value")
            .map_err(|e| classify(&ctx, e, deadline, &limits))?;
        convert::js_to_json(&ctx, value)
    })
    // Runtime and context drop here; the guest is disposed even on error.
}

/// The tool body: `module.exports.default` when present, otherwise the
/// whole exports value.
fn entry_target<'js>(exports: &Value<'js>) -> rquickjs::Result<Value<'js>> {
    if let Some(object) = exports.as_object() {
        let default: Value = object.get("default")?;
        if !default.is_undefined() {
            return Ok(default);
        }
    }
    Ok(exports.clone())
}

fn slot<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    ctx.globals().get("__tgp_result")
}

fn classify(
    ctx: &Ctx<'_>,
    err: rquickjs::Error,
    deadline: Instant,
    limits: &SandboxLimits,
) -> KernelError {
    match err {
        rquickjs::Error::Exception => {
            let thrown = ctx.catch();
            let text = exception_text(&thrown);
            let lowered = text.to_lowercase();
            if lowered.contains("interrupted") || Instant::now() >= deadline {
                return KernelError::Timeout(limits.timeout_ms());
            }
            if lowered.contains("out of memory") {
                return KernelError::MemoryLimit(limits.memory_limit_bytes);
            }
            if exception_name(&thrown).as_deref() == Some("SyntaxError") {
                return KernelError::CompileError(text);
            }
            KernelError::GuestThrew(text)
        }
        other => {
            if Instant::now() >= deadline {
                KernelError::Timeout(limits.timeout_ms())
            } else {
                KernelError::InternalSandboxError(other.to_string())
            }
        }
    }
}

fn throw_kernel(ctx: &Ctx<'_>, err: KernelError) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}

/// Expose the bridge leaves as host function references, then assemble the
/// `tgp` namespace and the capture slot with a guest-side shim.
fn install_bridge(ctx: &Ctx<'_>, bridge: &Arc<Bridge>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    globals.set(
        "__tgp_read_file",
        Func::from({
            let bridge = Arc::clone(bridge);
            move |ctx: Ctx<'_>, path: String| -> rquickjs::Result<String> {
                bridge.read_file(&path).map_err(|e| throw_kernel(&ctx, e))
            }
        }),
    )?;

    globals.set(
        "__tgp_write_file",
        Func::from({
            let bridge = Arc::clone(bridge);
            move |ctx: Ctx<'_>, path: String, content: String| -> rquickjs::Result<()> {
                bridge
                    .write_file(&path, &content)
                    .map_err(|e| throw_kernel(&ctx, e))
            }
        }),
    )?;

    globals.set(
        "__tgp_list_files",
        Func::from({
            let bridge = Arc::clone(bridge);
            move |ctx: Ctx<'_>, dir: String| -> rquickjs::Result<Vec<String>> {
                bridge.list_files(&dir).map_err(|e| throw_kernel(&ctx, e))
            }
        }),
    )?;

    globals.set(
        "__tgp_fetch",
        Func::from({
            let bridge = Arc::clone(bridge);
            move |ctx: Ctx<'_>, url: String, init: Opt<String>| -> rquickjs::Result<String> {
                let response = bridge
                    .fetch(&url, init.0)
                    .map_err(|e| throw_kernel(&ctx, e))?;
                serde_json::to_string(&response).map_err(|e| {
                    throw_kernel(
                        &ctx,
                        KernelError::InternalSandboxError(format!("fetch encode failed: {}", e)),
                    )
                })
            }
        }),
    )?;

    globals.set(
        "__tgp_log",
        Func::from({
            let bridge = Arc::clone(bridge);
            move |line: String| bridge.log(line)
        }),
    )?;

    globals.set(
        "__tgp_ext",
        Func::from({
            let bridge = Arc::clone(bridge);
            move |ctx: Ctx<'_>, name: String, args_json: String| -> rquickjs::Result<String> {
                let args: serde_json::Value = serde_json::from_str(&args_json)
                    .unwrap_or(serde_json::Value::Array(Vec::new()));
                let result = bridge
                    .call_extension(&name, args)
                    .map_err(|e| throw_kernel(&ctx, e))?;
                serde_json::to_string(&result).map_err(|e| {
                    throw_kernel(
                        &ctx,
                        KernelError::InternalSandboxError(format!(
                            "extension encode failed: {}",
                            e
                        )),
                    )
                })
            }
        }),
    )?;

    let mut shim = String::from(BRIDGE_SHIM);
    for name in bridge.extension_names() {
        let quoted = serde_json::to_string(&name).unwrap_or_else(|_| "\"\"".to_string());
        shim.push_str(&format!(
            "globalThis.tgp[{0}] = (...args) => JSON.parse(__tgp_ext({0}, JSON.stringify(args)));\n",
            quoted
        ));
    }
    ctx.eval::<(), _>(shim)?;
    Ok(())
}

const BRIDGE_SHIM: &str = r#"
globalThis.tgp = {
  read_file: (path) => __tgp_read_file(path),
  write_file: (path, content) => __tgp_write_file(path, content),
  list_files: (dir) => __tgp_list_files(dir),
  log: (...args) => __tgp_log(args.map((a) => typeof a === 'string' ? a : JSON.stringify(a)).join(' ')),
  fetch: (url, init) => {
    const raw = __tgp_fetch(url, init === undefined ? undefined : JSON.stringify(init));
    const r = JSON.parse(raw);
    return {
      status: r.status,
      statusText: r.statusText,
      headers: r.headers,
      text: () => r.body,
      json: () => JSON.parse(r.body),
    };
  },
};
globalThis.console = {
  log: globalThis.tgp.log,
  info: globalThis.tgp.log,
  warn: globalThis.tgp.log,
  error: globalThis.tgp.log,
};
globalThis.__tgp_result = { state: 'pending', value: undefined, error: undefined };
globalThis.__tgp_capture = (out) => {
  const slot = globalThis.__tgp_result;
  if (out && typeof out.then === 'function') {
    out.then(
      (v) => { slot.state = 'fulfilled'; slot.value = v; },
      (e) => { slot.state = 'rejected'; slot.error = e; },
    );
  } else {
    slot.state = 'fulfilled';
    slot.value = out;
  }
};
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::vfs::{MemoryVfs, Vfs};

    fn test_config() -> Config {
        Config::from_json(
            r#"{
                "rootDir": "/tmp/sandbox-test",
                "git": { "repo": "a/b", "auth": { "token": "t" } }
            }"#,
        )
        .expect("config")
    }

    fn limits(timeout_ms: u64) -> SandboxLimits {
        SandboxLimits {
            memory_limit_bytes: 128 * 1024 * 1024,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn run(
        vfs: Arc<MemoryVfs>,
        entry: &str,
        args: Option<serde_json::Value>,
        timeout_ms: u64,
    ) -> ExecutionResult {
        let config = test_config();
        let source = vfs.read_file(entry).await.expect("entry source");
        let sandbox = Sandbox::new(vfs.clone(), limits(timeout_ms));
        let bridge = Bridge::new(
            vfs,
            &config,
            Vec::new(),
            tokio::runtime::Handle::current(),
            Instant::now() + Duration::from_millis(timeout_ms),
        );
        sandbox.compile_and_run(entry, &source, args, bridge).await
    }

    async fn seeded(files: &[(&str, &str)]) -> Arc<MemoryVfs> {
        let vfs = Arc::new(MemoryVfs::new(true));
        for (path, content) in files {
            vfs.write_file(path, content).await.expect("seed");
        }
        vfs
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_default_export_with_args() {
        let vfs = seeded(&[(
            "tools/math/fib.ts",
            r#"/** Computes the n-th Fibonacci number. */
export default function fib(args: { n: number }): number {
  let a = 0, b = 1;
  for (let i = 0; i < args.n; i++) {
    const next = a + b;
    a = b;
    b = next;
  }
  return a;
}
"#,
        )])
        .await;

        let result = run(vfs, "tools/math/fib.ts", Some(serde_json::json!({"n": 10})), 5000).await;
        assert_eq!(result.error, None);
        assert!(result.success);
        assert_eq!(result.result, Some(serde_json::json!(55)));
        assert!(result.logs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn captures_logs_in_call_order() {
        let vfs = seeded(&[(
            "tools/noisy.ts",
            r#"export default function noisy(args: unknown) {
  tgp.log('starting');
  tgp.log('value:', { nested: 1 });
  console.log('via console');
  return null;
}
"#,
        )])
        .await;

        let result = run(vfs, "tools/noisy.ts", None, 5000).await;
        assert!(result.success);
        assert_eq!(
            result.logs,
            vec![
                "starting".to_string(),
                "value: {\"nested\":1}".to_string(),
                "via console".to_string(),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn infinite_loop_times_out_within_envelope() {
        let vfs = seeded(&[("tools/freeze.ts", "export default function f() { while (true) {} }")]).await;

        let started = Instant::now();
        let result = run(vfs, "tools/freeze.ts", None, 300).await;
        let elapsed = started.elapsed();

        assert!(!result.success);
        let error = result.error.expect("timeout error");
        assert!(error.to_lowercase().contains("timed out"), "got: {}", error);
        assert!(elapsed < Duration::from_millis(300 + 250), "took {:?}", elapsed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn jailbreak_read_reports_security_violation() {
        let vfs = seeded(&[(
            "tools/hack.ts",
            r#"export default function hack() {
  return tgp.read_file('../../package.json');
}
"#,
        )])
        .await;

        let result = run(vfs, "tools/hack.ts", None, 5000).await;
        assert!(!result.success);
        let error = result.error.expect("error");
        assert!(
            error.to_lowercase().contains("security violation"),
            "got: {}",
            error
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn require_composes_tools() {
        let vfs = seeded(&[
            (
                "tools/lib/multiplier.ts",
                r#"/** Multiplies two numbers. */
export default function multiply(a: number, b: number): number {
  return a * b;
}
"#,
            ),
            (
                "tools/calc.ts",
                r#"/** Multiplies and adds 100. */
import multiply from './lib/multiplier';

export default function calc(args: { a: number, b: number }): number {
  return multiply(args.a, args.b) + 100;
}
"#,
            ),
        ])
        .await;

        let result = run(
            vfs,
            "tools/calc.ts",
            Some(serde_json::json!({"a": 5, "b": 5})),
            5000,
        )
        .await;
        assert_eq!(result.error, None);
        assert_eq!(result.result, Some(serde_json::json!(125)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_dependency_names_the_module() {
        let vfs = seeded(&[(
            "tools/broken.ts",
            "import x from './nope';\nexport default () => x;",
        )])
        .await;

        let result = run(vfs, "tools/broken.ts", None, 5000).await;
        assert!(!result.success);
        let error = result.error.expect("error");
        assert!(error.contains("Cannot find module './nope'"), "got: {}", error);
        assert!(error.contains("tools/nope.ts"), "got: {}", error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn guest_throw_is_captured_not_propagated() {
        let vfs = seeded(&[(
            "tools/thrower.ts",
            "export default function t() { throw new Error('deliberate'); }",
        )])
        .await;

        let result = run(vfs, "tools/thrower.ts", None, 5000).await;
        assert!(!result.success);
        assert!(result.error.expect("error").contains("deliberate"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_tools_resolve_through_the_job_queue() {
        let vfs = seeded(&[(
            "tools/later.ts",
            r#"export default async function later(args: { n: number }) {
  const doubled = await Promise.resolve(args.n * 2);
  return doubled;
}
"#,
        )])
        .await;

        let result = run(vfs, "tools/later.ts", Some(serde_json::json!({"n": 21})), 5000).await;
        assert_eq!(result.error, None);
        assert_eq!(result.result, Some(serde_json::json!(42)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn value_default_export_is_the_result() {
        let vfs = seeded(&[("tools/constant.ts", "export default 42;")]).await;
        let result = run(vfs, "tools/constant.ts", None, 5000).await;
        assert!(result.success);
        assert_eq!(result.result, Some(serde_json::json!(42)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compile_error_is_reported_with_location() {
        let vfs = seeded(&[("tools/bad.ts", "export default function ((( {")]).await;
        let result = run(vfs, "tools/bad.ts", None, 5000).await;
        assert!(!result.success);
        assert!(result.error.expect("error").contains("Compile error"));
    }
}
