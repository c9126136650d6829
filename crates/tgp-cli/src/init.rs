//! `tgp init` - project scaffolding
//!
//! Creates `tgp.config.json`, `.gitignore`, the `.tgp/` data root, and an
//! empty `meta.json`. Existing files are left untouched.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::CONFIG_FILE;

const CONFIG_TEMPLATE: &str = r#"{
  "rootDir": ".tgp",
  "git": {
    "provider": "github",
    "repo": "owner/toolbox",
    "branch": "main",
    "auth": {
      "token": "${TGP_GIT_TOKEN}",
      "user": "tgp-agent",
      "email": "agent@tgp.local"
    },
    "writeStrategy": "direct"
  },
  "fs": {
    "allowedDirs": ["tools"],
    "blockUpwardTraversal": true
  },
  "allowedImports": [],
  "allowedFetchUrls": []
}
"#;

const GITIGNORE_TEMPLATE: &str = ".tgp/\n";

const EMPTY_META: &str = "{\n  \"tools\": {}\n}\n";

pub fn run(dir: &Path) -> Result<()> {
    scaffold_file(&dir.join(CONFIG_FILE), CONFIG_TEMPLATE)?;
    scaffold_file(&dir.join(".gitignore"), GITIGNORE_TEMPLATE)?;

    let data_root = dir.join(".tgp");
    std::fs::create_dir_all(&data_root)
        .with_context(|| format!("Failed to create {}", data_root.display()))?;
    scaffold_file(&data_root.join("meta.json"), EMPTY_META)?;

    // Surface config problems now rather than at first boot.
    match crate::config::load_config(dir) {
        Ok(_) => info!("config is valid"),
        Err(e) => println!("note: config needs attention before boot: {:#}", e),
    }

    println!("Initialized TGP project in {}", dir.display());
    println!("Next: set git.repo in {} and export TGP_GIT_TOKEN.", CONFIG_FILE);
    Ok(())
}

fn scaffold_file(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        info!(path = %path.display(), "keeping existing file");
        return Ok(());
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffolds_expected_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        run(dir.path()).expect("init");

        assert!(dir.path().join(CONFIG_FILE).is_file());
        assert!(dir.path().join(".gitignore").is_file());
        assert!(dir.path().join(".tgp").is_dir());

        let meta = std::fs::read_to_string(dir.path().join(".tgp/meta.json")).expect("meta");
        let parsed: serde_json::Value = serde_json::from_str(&meta).expect("valid json");
        assert_eq!(parsed["tools"], serde_json::json!({}));
    }

    #[test]
    fn init_is_idempotent_and_preserves_edits() {
        let dir = tempfile::tempdir().expect("tempdir");
        run(dir.path()).expect("init");
        std::fs::write(dir.path().join(CONFIG_FILE), "{ \"edited\": true }").expect("edit");
        run(dir.path()).expect("re-init");

        let kept = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).expect("read");
        assert!(kept.contains("edited"));
    }
}
