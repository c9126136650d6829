//! Static tool linter
//!
//! `check_tool` runs a pluggable list of named predicates over the parsed
//! source. Rules work on a real syntax tree; doc-comment lookalikes and
//! `eval` strings inside template literals never false-positive.

use std::collections::HashSet;

use tree_sitter::{Node, Parser, Tree};

/// Integer literals that never need a name.
const ALLOWED_NUMBERS: [&str; 8] = ["0", "1", "2", "10", "100", "1000", "0.5", "-1"];
/// Shannon entropy above this, on a long literal, smells like a secret.
const ENTROPY_THRESHOLD: f64 = 4.5;
const ENTROPY_MIN_LENGTH: usize = 24;
/// Hard cap on tool source size.
const MAX_SOURCE_BYTES: usize = 20_000;

pub struct LintContext<'a> {
    pub source: &'a str,
    pub tree: &'a Tree,
}

impl LintContext<'_> {
    fn text(&self, node: Node<'_>) -> &str {
        &self.source[node.byte_range()]
    }

    /// Depth-first visit of every node, named and anonymous.
    fn for_each_node(&self, mut visit: impl FnMut(Node<'_>)) {
        let mut stack = vec![self.tree.root_node()];
        while let Some(node) = stack.pop() {
            visit(node);
            for i in (0..node.child_count()).rev() {
                if let Some(child) = node.child(i) {
                    stack.push(child);
                }
            }
        }
    }
}

/// A named predicate over tool source. Returns one message per violation.
pub trait LintRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &LintContext<'_>) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct LintReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

pub struct Linter {
    rules: Vec<Box<dyn LintRule>>,
}

impl Linter {
    pub fn new(rules: Vec<Box<dyn LintRule>>) -> Self {
        Self { rules }
    }

    /// The standard rule set. `allowed_imports` feeds the bare-import rule.
    pub fn with_default_rules(allowed_imports: Vec<String>) -> Self {
        Self::new(vec![
            Box::new(NoDynamicEval),
            Box::new(NoProcessGlobals),
            Box::new(NoAnyType),
            Box::new(NumericLiteralAllowList),
            Box::new(NoHighEntropyStrings),
            Box::new(DefaultExportRequired),
            Box::new(ImportAllowList {
                allowed: allowed_imports.into_iter().collect(),
            }),
            Box::new(SourceLengthCap),
        ])
    }

    pub fn check(&self, source: &str) -> LintReport {
        let language: tree_sitter::Language = tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into();
        let mut parser = Parser::new();
        if parser.set_language(&language).is_err() {
            return LintReport {
                valid: false,
                errors: vec!["linter: parser initialization failed".to_string()],
            };
        }
        let Some(tree) = parser.parse(source, None) else {
            return LintReport {
                valid: false,
                errors: vec!["linter: source could not be parsed".to_string()],
            };
        };
        if tree.root_node().has_error() {
            return LintReport {
                valid: false,
                errors: vec!["syntax: source contains syntax errors".to_string()],
            };
        }

        let ctx = LintContext {
            source,
            tree: &tree,
        };
        let mut errors = Vec::new();
        for rule in &self.rules {
            for message in rule.check(&ctx) {
                errors.push(format!("{}: {}", rule.name(), message));
            }
        }

        LintReport {
            valid: errors.is_empty(),
            errors,
        }
    }
}

fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

/// Forbid the dynamic evaluation primitives.
struct NoDynamicEval;

impl LintRule for NoDynamicEval {
    fn name(&self) -> &'static str {
        "no-dynamic-eval"
    }

    fn check(&self, ctx: &LintContext<'_>) -> Vec<String> {
        let mut errors = Vec::new();
        ctx.for_each_node(|node| match node.kind() {
            "call_expression" => {
                if let Some(callee) = node.child_by_field_name("function") {
                    if callee.kind() == "identifier" && ctx.text(callee) == "eval" {
                        errors.push(format!("eval() is forbidden (line {})", line_of(node)));
                    }
                }
            }
            "new_expression" => {
                if let Some(ctor) = node.child_by_field_name("constructor") {
                    if ctor.kind() == "identifier" && ctx.text(ctor) == "Function" {
                        errors.push(format!(
                            "new Function() is forbidden (line {})",
                            line_of(node)
                        ));
                    }
                }
            }
            _ => {}
        });
        errors
    }
}

/// Forbid reaching for the host process object.
struct NoProcessGlobals;

impl LintRule for NoProcessGlobals {
    fn name(&self) -> &'static str {
        "no-process-globals"
    }

    fn check(&self, ctx: &LintContext<'_>) -> Vec<String> {
        let mut errors = Vec::new();
        ctx.for_each_node(|node| {
            if node.kind() == "identifier" && ctx.text(node) == "process" {
                errors.push(format!(
                    "access to the host process object is forbidden (line {})",
                    line_of(node)
                ));
            }
            if node.kind() == "member_expression" && ctx.text(node) == "globalThis.process" {
                errors.push(format!(
                    "access to the host process object is forbidden (line {})",
                    line_of(node)
                ));
            }
        });
        errors
    }
}

/// Forbid the permissive top type.
struct NoAnyType;

impl LintRule for NoAnyType {
    fn name(&self) -> &'static str {
        "no-any"
    }

    fn check(&self, ctx: &LintContext<'_>) -> Vec<String> {
        let mut errors = Vec::new();
        ctx.for_each_node(|node| {
            if node.kind() == "predefined_type" && ctx.text(node) == "any" {
                errors.push(format!(
                    "the 'any' type is forbidden, use a concrete type (line {})",
                    line_of(node)
                ));
            }
        });
        errors
    }
}

/// Numeric literals outside the allow-list must be bound to a named
/// declaration so the magic number carries a name.
struct NumericLiteralAllowList;

impl LintRule for NumericLiteralAllowList {
    fn name(&self) -> &'static str {
        "no-magic-numbers"
    }

    fn check(&self, ctx: &LintContext<'_>) -> Vec<String> {
        let mut errors = Vec::new();
        ctx.for_each_node(|node| {
            if node.kind() != "number" {
                return;
            }
            let text = ctx.text(node);
            if ALLOWED_NUMBERS.contains(&text) {
                return;
            }
            let mut ancestor = node.parent();
            while let Some(current) = ancestor {
                if current.kind() == "variable_declarator" {
                    return;
                }
                ancestor = current.parent();
            }
            errors.push(format!(
                "numeric literal {} should be a named constant (line {})",
                text,
                line_of(node)
            ));
        });
        errors
    }
}

/// Long high-entropy string literals look like embedded secrets.
struct NoHighEntropyStrings;

impl LintRule for NoHighEntropyStrings {
    fn name(&self) -> &'static str {
        "no-high-entropy-strings"
    }

    fn check(&self, ctx: &LintContext<'_>) -> Vec<String> {
        let mut errors = Vec::new();
        ctx.for_each_node(|node| {
            if node.kind() != "string_fragment" {
                return;
            }
            let text = ctx.text(node);
            if text.len() >= ENTROPY_MIN_LENGTH && shannon_entropy(text) > ENTROPY_THRESHOLD {
                errors.push(format!(
                    "string literal looks like an embedded secret (line {})",
                    line_of(node)
                ));
            }
        });
        errors
    }
}

fn shannon_entropy(text: &str) -> f64 {
    let mut counts = [0usize; 256];
    let bytes = text.as_bytes();
    for &byte in bytes {
        counts[byte as usize] += 1;
    }
    let total = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Every tool needs a default export: that is its body.
struct DefaultExportRequired;

impl LintRule for DefaultExportRequired {
    fn name(&self) -> &'static str {
        "default-export-required"
    }

    fn check(&self, ctx: &LintContext<'_>) -> Vec<String> {
        let mut found = false;
        ctx.for_each_node(|node| {
            if node.kind() == "export_statement" && ctx.text(node).starts_with("export default") {
                found = true;
            }
        });
        if found {
            Vec::new()
        } else {
            vec!["tool has no default export".to_string()]
        }
    }
}

/// Bare imports are restricted to the configured allow-list; relative
/// imports always resolve through the module resolver and are fine.
struct ImportAllowList {
    allowed: HashSet<String>,
}

impl LintRule for ImportAllowList {
    fn name(&self) -> &'static str {
        "import-allow-list"
    }

    fn check(&self, ctx: &LintContext<'_>) -> Vec<String> {
        let mut errors = Vec::new();
        ctx.for_each_node(|node| {
            let specifier = match node.kind() {
                "import_statement" => node
                    .child_by_field_name("source")
                    .map(|source| ctx.text(source).trim_matches(|c| c == '\'' || c == '"' || c == '`').to_string()),
                "call_expression" => {
                    let callee = node.child_by_field_name("function");
                    let is_require = callee
                        .map(|c| c.kind() == "identifier" && ctx.text(c) == "require")
                        .unwrap_or(false);
                    if !is_require {
                        None
                    } else {
                        node.child_by_field_name("arguments")
                            .and_then(|arguments| arguments.named_child(0))
                            .filter(|argument| argument.kind() == "string")
                            .map(|argument| {
                                ctx.text(argument).trim_matches(|c| c == '\'' || c == '"' || c == '`').to_string()
                            })
                    }
                }
                _ => None,
            };

            if let Some(specifier) = specifier {
                if !specifier.starts_with('.')
                    && !specifier.starts_with("tools/")
                    && !self.allowed.contains(&specifier)
                {
                    errors.push(format!(
                        "import of '{}' is not in the allow-list (line {})",
                        specifier,
                        line_of(node)
                    ));
                }
            }
        });
        errors
    }
}

/// Oversized tools are a smell and a guest-memory hazard.
struct SourceLengthCap;

impl LintRule for SourceLengthCap {
    fn name(&self) -> &'static str {
        "source-length"
    }

    fn check(&self, ctx: &LintContext<'_>) -> Vec<String> {
        if ctx.source.len() > MAX_SOURCE_BYTES {
            vec![format!(
                "source is {} bytes, cap is {}",
                ctx.source.len(),
                MAX_SOURCE_BYTES
            )]
        } else {
            Vec::new()
        }
    }
}
