//! End-to-end kernel scenarios against local bare remotes
//!
//! Each test boots a full kernel (disk VFS, git persistence, registry,
//! sandbox) with a file-path remote so the whole write pipeline and the
//! hydrate path run hermetically.

use std::path::Path;
use std::time::{Duration, Instant};

use git2::{Repository, Signature};
use tgp_core::{Config, Kernel};

/// Seed a bare repository with an initial commit holding an empty
/// `meta.json` on `main`.
fn bare_remote(dir: &Path) -> String {
    let path = dir.join("remote.git");
    let repo = Repository::init_bare(&path).expect("init bare");
    {
        let blob = repo
            .blob(b"{\n  \"tools\": {}\n}")
            .expect("meta blob");
        let mut builder = repo.treebuilder(None).expect("treebuilder");
        builder.insert("meta.json", blob, 0o100_644).expect("insert");
        let tree_id = builder.write().expect("tree");
        let tree = repo.find_tree(tree_id).expect("find tree");
        let signature = Signature::now("seed", "seed@example.com").expect("signature");
        repo.commit(
            Some("refs/heads/main"),
            &signature,
            &signature,
            "Initial commit",
            &tree,
            &[],
        )
        .expect("seed commit");
    }
    repo.set_head("refs/heads/main").expect("set head");
    path.to_string_lossy().to_string()
}

fn config_json(root: &Path, remote: &str, timeout_ms: u64) -> Config {
    let json = serde_json::json!({
        "rootDir": root.to_string_lossy(),
        "git": {
            "repo": remote,
            "branch": "main",
            "auth": { "token": "unused-local-token" }
        },
        "sandbox": { "timeoutMs": timeout_ms }
    });
    Config::from_json(&json.to_string()).expect("valid config")
}

async fn booted_kernel(root: &Path, remote: &str, timeout_ms: u64) -> Kernel {
    let kernel = Kernel::new(config_json(root, remote, timeout_ms)).expect("kernel");
    kernel.boot().await.expect("boot");
    kernel
}

const FIB_TOOL: &str = r#"/** Computes the n-th Fibonacci number iteratively. */
export default function fib(args: { n: number }): number {
  let a = 0, b = 1;
  for (let i = 0; i < args.n; i++) {
    const next = a + b;
    a = b;
    b = next;
  }
  return a;
}
"#;

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_fabricate_and_execute() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());
    let kernel = booted_kernel(&scratch.path().join("agent"), &remote, 5000).await;

    let outcome = kernel
        .write_tool("tools/math/fib.ts", FIB_TOOL)
        .await
        .expect("write pipeline");
    assert_eq!(outcome.persisted_label(), "pushed");

    let result = kernel
        .exec_tool("tools/math/fib.ts", Some(serde_json::json!({"n": 10})))
        .await;
    assert_eq!(result.error, None);
    assert_eq!(result.result, Some(serde_json::json!(55)));

    // A fresh clone of the remote contains the tool and its metadata.
    let clone_dir = scratch.path().join("verify");
    let cloned = Repository::clone(&remote, &clone_dir).expect("fresh clone");
    assert!(clone_dir.join("tools/math/fib.ts").is_file());
    let meta = std::fs::read_to_string(clone_dir.join("meta.json")).expect("meta.json");
    let parsed: serde_json::Value = serde_json::from_str(&meta).expect("json");
    assert_eq!(parsed["tools"]["tools/math/fib.ts"]["name"], "fib");
    assert_eq!(
        parsed["tools"]["tools/math/fib.ts"]["description"],
        "Computes the n-th Fibonacci number iteratively."
    );
    drop(cloned);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_disjoint_writes_converge() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());

    let kernel_a = booted_kernel(&scratch.path().join("agent-a"), &remote, 5000).await;
    let kernel_b = booted_kernel(&scratch.path().join("agent-b"), &remote, 5000).await;

    let tool_a = "/** Tool A. */\nexport default function a() { return 'a'; }\n";
    let tool_b = "/** Tool B. */\nexport default function b() { return 'b'; }\n";

    let (a, b) = tokio::join!(
        kernel_a.write_tool("tools/tool_A.ts", tool_a),
        kernel_b.write_tool("tools/tool_B.ts", tool_b),
    );
    a.expect("agent A pipeline");
    b.expect("agent B pipeline");

    // A third agent boots from the same remote and sees both files.
    let kernel_c = booted_kernel(&scratch.path().join("agent-c"), &remote, 5000).await;
    let files = kernel_c.list_files("tools").await.expect("list");
    assert!(files.contains(&"tool_A.ts".to_string()), "files: {:?}", files);
    assert!(files.contains(&"tool_B.ts".to_string()), "files: {:?}", files);

    // Both commits are reachable from the branch head.
    let verify = Repository::clone(&remote, scratch.path().join("verify")).expect("clone");
    let head = verify.head().expect("head").peel_to_commit().expect("commit");
    let mut walk = verify.revwalk().expect("revwalk");
    walk.push(head.id()).expect("push");
    let messages: Vec<String> = walk
        .filter_map(|oid| oid.ok())
        .filter_map(|oid| verify.find_commit(oid).ok())
        .filter_map(|c| c.message().map(str::to_string))
        .collect();
    assert!(messages.iter().any(|m| m.contains("tools/tool_A.ts")));
    assert!(messages.iter().any(|m| m.contains("tools/tool_B.ts")));
}

#[tokio::test(flavor = "multi_thread")]
async fn refactor_via_patch_changes_behavior() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());
    let kernel = booted_kernel(&scratch.path().join("agent"), &remote, 5000).await;

    kernel
        .write_tool(
            "tools/greet.ts",
            r#"/** Greets someone by name. */
export default function greet(args: { name: string }): string {
  return "hello " + args.name;
}
"#,
        )
        .await
        .expect("write");

    let before = kernel
        .exec_tool("tools/greet.ts", Some(serde_json::json!({"name": "world"})))
        .await;
    assert_eq!(before.result, Some(serde_json::json!("hello world")));

    kernel
        .patch_tool("tools/greet.ts", "hello ", "greetings ")
        .await
        .expect("patch");

    let after = kernel
        .exec_tool("tools/greet.ts", Some(serde_json::json!({"name": "world"})))
        .await;
    assert_eq!(after.result, Some(serde_json::json!("greetings world")));
}

#[tokio::test(flavor = "multi_thread")]
async fn patch_fails_when_search_is_absent() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());
    let kernel = booted_kernel(&scratch.path().join("agent"), &remote, 5000).await;

    kernel
        .write_tool("tools/t.ts", "export default () => 1;\n")
        .await
        .expect("write");

    let err = kernel
        .patch_tool("tools/t.ts", "no such text", "replacement")
        .await
        .expect_err("must fail");
    assert!(matches!(err, tgp_core::KernelError::PatchNotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn infinite_loop_is_cut_at_the_deadline() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());
    let kernel = booted_kernel(&scratch.path().join("agent"), &remote, 800).await;

    kernel
        .write_tool(
            "tools/freeze.ts",
            "export default function freeze() { while (true) {} }\n",
        )
        .await
        .expect("write");

    let started = Instant::now();
    let result = kernel.exec_tool("tools/freeze.ts", None).await;
    let elapsed = started.elapsed();

    assert!(!result.success);
    let error = result.error.expect("error");
    assert!(error.to_lowercase().contains("timed out"), "got: {}", error);
    assert!(
        elapsed < Duration::from_millis(800 + 300),
        "took {:?}",
        elapsed
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn jailbreak_attempt_is_reported_as_security_violation() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());
    let kernel = booted_kernel(&scratch.path().join("agent"), &remote, 5000).await;

    kernel
        .write_tool(
            "tools/hack.ts",
            r#"export default function hack() {
  return tgp.read_file("../../package.json");
}
"#,
        )
        .await
        .expect("write");

    let result = kernel.exec_tool("tools/hack.ts", None).await;
    assert!(!result.success);
    let error = result.error.expect("error");
    assert!(
        error.to_lowercase().contains("security violation"),
        "got: {}",
        error
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn orchestrator_tool_composes_a_library_tool() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());
    let kernel = booted_kernel(&scratch.path().join("agent"), &remote, 5000).await;

    kernel
        .write_tool(
            "tools/lib/multiplier.ts",
            r#"/** Multiplies two numbers. */
export default function multiply(a: number, b: number): number {
  return a * b;
}
"#,
        )
        .await
        .expect("write multiplier");
    kernel
        .write_tool(
            "tools/calc.ts",
            r#"/** Multiplies two numbers and adds 100. */
import multiply from './lib/multiplier';

export default function calc(args: { a: number, b: number }): number {
  return multiply(args.a, args.b) + 100;
}
"#,
        )
        .await
        .expect("write calc");

    let result = kernel
        .exec_tool("tools/calc.ts", Some(serde_json::json!({"a": 5, "b": 5})))
        .await;
    assert_eq!(result.error, None);
    assert_eq!(result.result, Some(serde_json::json!(125)));
}

#[tokio::test(flavor = "multi_thread")]
async fn check_tool_reports_lint_violations() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());
    let kernel = booted_kernel(&scratch.path().join("agent"), &remote, 5000).await;

    kernel
        .write_tool(
            "tools/sketchy.ts",
            "export default function s(x: any) { return eval('x'); }\n",
        )
        .await
        .expect("write");

    let report = kernel.check_tool("tools/sketchy.ts").await.expect("check");
    assert!(!report.valid);
    assert!(report.errors.iter().any(|e| e.contains("no-dynamic-eval")));
    assert!(report.errors.iter().any(|e| e.contains("no-any")));
}

#[tokio::test(flavor = "multi_thread")]
async fn non_tool_writes_skip_the_registry() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());
    let kernel = booted_kernel(&scratch.path().join("agent"), &remote, 5000).await;

    kernel
        .write_tool("docs/notes.md", "# notes\n")
        .await
        .expect("write");
    assert!(kernel.list_tools().await.is_empty());

    kernel
        .write_tool("tools/real.ts", "/** Real. */\nexport default () => 1;\n")
        .await
        .expect("write");
    let tools = kernel.list_tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "real");
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_tool_surfaces_missing_tool_in_result() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote = bare_remote(scratch.path());
    let kernel = booted_kernel(&scratch.path().join("agent"), &remote, 5000).await;

    let result = kernel.exec_tool("tools/absent.ts", None).await;
    assert!(!result.success);
    assert!(result.error.expect("error").contains("Not found"));
}
