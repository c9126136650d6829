//! Tool metadata extraction
//!
//! Pulls `{name, description}` out of tool source with a real parser.
//! Regex scraping is off the table: doc-comment lookalikes inside strings
//! and templates must not count.

use tree_sitter::{Node, Parser};

use super::ToolMetadata;

/// Derive metadata for a tool file. Total: unparsable sources still yield
/// the fallback description, never an error.
pub fn extract(path: &str, source: &str) -> ToolMetadata {
    ToolMetadata {
        name: tool_name(path),
        description: description_of(source)
            .unwrap_or_else(|| "No description provided.".to_string()),
        path: path.to_string(),
    }
}

/// Registry name: file base-name without extension.
fn tool_name(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    match base.rfind('.') {
        Some(idx) if idx > 0 => base[..idx].to_string(),
        _ => base.to_string(),
    }
}

fn description_of(source: &str) -> Option<String> {
    let language: tree_sitter::Language = tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into();
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(source, None)?;
    let root = tree.root_node();

    // Doc-comment attached to the first top-level declaration.
    if let Some(doc) = first_declaration_doc(root, source) {
        return Some(doc);
    }

    // Fallback: the file's leading doc-comment.
    let first = root.named_child(0)?;
    if first.kind() == "comment" {
        let text = node_text(first, source);
        if text.starts_with("/**") {
            let cleaned = clean_doc_comment(text);
            if !cleaned.is_empty() {
                return Some(cleaned);
            }
        }
    }
    None
}

fn first_declaration_doc(root: Node<'_>, source: &str) -> Option<String> {
    let mut cursor = root.walk();
    let mut previous: Option<Node<'_>> = None;

    for child in root.named_children(&mut cursor) {
        match child.kind() {
            "comment" => {
                previous = Some(child);
                continue;
            }
            "import_statement" => {
                previous = None;
                continue;
            }
            _ => {}
        }

        let doc = previous.filter(|node| {
            node.kind() == "comment" && node_text(*node, source).starts_with("/**")
        })?;
        let cleaned = clean_doc_comment(node_text(doc, source));
        return if cleaned.is_empty() { None } else { Some(cleaned) };
    }
    None
}

fn node_text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

/// Strip `/**` and `*/`, leading `*` per line, drop `@tag` lines, join the
/// remaining non-empty lines with single spaces.
fn clean_doc_comment(raw: &str) -> String {
    let body = raw
        .trim()
        .trim_start_matches("/**")
        .trim_end_matches("*/");

    let mut lines = Vec::new();
    for line in body.lines() {
        let mut cleaned = line.trim();
        if let Some(rest) = cleaned.strip_prefix('*') {
            cleaned = rest.trim();
        }
        if cleaned.is_empty() || cleaned.starts_with('@') {
            continue;
        }
        lines.push(cleaned);
    }
    lines.join(" ")
}
