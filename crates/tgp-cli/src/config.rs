//! Config file loading for the CLI
//!
//! The kernel reads no environment variables; token injection happens
//! here, by expanding `${VAR}` placeholders in `tgp.config.json` before
//! the document is parsed.

use std::path::Path;

use anyhow::{Context, Result};
use tgp_core::Config;

pub const CONFIG_FILE: &str = "tgp.config.json";

/// Load and validate a config file, expanding `${VAR}` placeholders from
/// the process environment. Unset variables expand to the empty string.
pub fn load_config(dir: &Path) -> Result<Config> {
    let path = dir.join(CONFIG_FILE);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let expanded = expand_env_placeholders(&raw, |name| std::env::var(name).ok());
    Config::from_json(&expanded).with_context(|| format!("Invalid config at {}", path.display()))
}

/// Replace `${NAME}` with the lookup result; unknown names become empty.
pub fn expand_env_placeholders(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Some(value) = lookup(name) {
                    output.push_str(&value);
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_placeholders_and_drops_unknown() {
        let expanded = expand_env_placeholders("token=${TOKEN}, missing=${NOPE}!", |name| {
            (name == "TOKEN").then(|| "secret".to_string())
        });
        assert_eq!(expanded, "token=secret, missing=!");
    }

    #[test]
    fn unterminated_placeholder_is_left_alone() {
        let expanded = expand_env_placeholders("broken ${TOKEN", |_| None);
        assert_eq!(expanded, "broken ${TOKEN");
    }

    #[test]
    fn loads_and_expands_a_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{
                "rootDir": ".tgp",
                "git": { "repo": "acme/toolbox", "auth": { "token": "${TGP_TEST_TOKEN_XYZ}" } }
            }"#,
        )
        .expect("write config");

        // Not set in the environment: expands to empty but still parses.
        let config = load_config(dir.path()).expect("config should load");
        assert_eq!(config.git.repo, "acme/toolbox");
    }
}
