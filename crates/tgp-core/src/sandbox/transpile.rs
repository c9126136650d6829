//! Tool source transpilation
//!
//! Tools are written in TypeScript; the guest engine executes JavaScript.
//! Compilation erases type-only syntax span-wise (keeping line numbers
//! stable where possible) and lowers ES module syntax onto the resolver's
//! CommonJS shape (`exports` / `module.exports` / `require`).
//!
//! Runtime-affecting TypeScript constructs (enums, namespaces, parameter
//! properties) are rejected rather than half-translated.

use tree_sitter::{Node, Parser};

use crate::error::{KernelError, Result};

enum Edit {
    /// Replace the span with whitespace, preserving newlines.
    Blank(usize, usize),
    /// Replace the span with new text.
    Replace(usize, usize, String),
}

impl Edit {
    fn start(&self) -> usize {
        match self {
            Edit::Blank(start, _) | Edit::Replace(start, _, _) => *start,
        }
    }

    fn end(&self) -> usize {
        match self {
            Edit::Blank(_, end) | Edit::Replace(_, end, _) => *end,
        }
    }
}

struct Lowering {
    edits: Vec<Edit>,
    /// Export bindings appended after the module body (hoisting makes this
    /// safe for functions and classes; consts are initialized by then).
    tail: Vec<String>,
    temp_counter: usize,
}

/// Compile tool source to guest-executable JavaScript.
pub fn strip_types(path: &str, source: &str) -> Result<String> {
    let language: tree_sitter::Language = tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into();
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(|e| KernelError::InternalSandboxError(format!("parser init failed: {}", e)))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| KernelError::CompileError(format!("{}: parse failed", path)))?;

    let root = tree.root_node();
    if root.has_error() {
        let position = find_error(root)
            .map(|node| {
                let point = node.start_position();
                format!("line {}, column {}", point.row + 1, point.column + 1)
            })
            .unwrap_or_else(|| "unknown location".to_string());
        return Err(KernelError::CompileError(format!(
            "{}: syntax error at {}",
            path, position
        )));
    }

    let mut lowering = Lowering {
        edits: Vec::new(),
        tail: Vec::new(),
        temp_counter: 0,
    };
    visit(root, source, path, &mut lowering)?;

    Ok(apply(source, lowering))
}

fn find_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(find_error)
}

fn visit(node: Node<'_>, source: &str, path: &str, out: &mut Lowering) -> Result<()> {
    match node.kind() {
        // Pure type syntax: blank it out.
        "type_annotation" | "type_arguments" | "type_parameters" | "implements_clause"
        | "override_modifier" => {
            out.edits.push(Edit::Blank(node.start_byte(), node.end_byte()));
            return Ok(());
        }
        "interface_declaration" | "type_alias_declaration" | "ambient_declaration"
        | "function_signature" => {
            out.edits.push(Edit::Blank(node.start_byte(), node.end_byte()));
            return Ok(());
        }
        // `expr as T` / `expr satisfies T`: keep the expression, blank the rest.
        "as_expression" | "satisfies_expression" | "non_null_expression" => {
            if let Some(first) = node.named_child(0) {
                out.edits.push(Edit::Blank(first.end_byte(), node.end_byte()));
                return visit(first, source, path, out);
            }
        }
        // `x?: T` parameters: blank the question mark (the annotation is
        // handled by the general case above).
        "optional_parameter" => {
            for i in 0..node.child_count() {
                if let Some(child) = node.child(i) {
                    if child.kind() == "?" {
                        out.edits.push(Edit::Blank(child.start_byte(), child.end_byte()));
                    }
                }
            }
        }
        "accessibility_modifier" => {
            let in_parameter = node
                .parent()
                .map(|p| p.kind().ends_with("_parameter"))
                .unwrap_or(false);
            if in_parameter {
                return Err(unsupported(path, node, "constructor parameter properties"));
            }
            out.edits.push(Edit::Blank(node.start_byte(), node.end_byte()));
            return Ok(());
        }
        // Constructs with runtime semantics that type stripping cannot keep.
        "enum_declaration" => return Err(unsupported(path, node, "TypeScript enums")),
        "internal_module" | "module" => {
            return Err(unsupported(path, node, "TypeScript namespaces"))
        }
        "abstract_class_declaration" => {
            return Err(unsupported(path, node, "abstract classes"))
        }
        "import_statement" => {
            lower_import(node, source, path, out)?;
            return Ok(());
        }
        "export_statement" => {
            lower_export(node, source, path, out)?;
            // Type erasure inside the exported declaration still applies.
        }
        _ => {}
    }

    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
    for child in children {
        visit(child, source, path, out)?;
    }
    Ok(())
}

fn unsupported(path: &str, node: Node<'_>, what: &str) -> KernelError {
    let point = node.start_position();
    KernelError::CompileError(format!(
        "{}: {} are not supported in tools (line {})",
        path,
        what,
        point.row + 1
    ))
}

fn has_token(node: Node<'_>, token: &str) -> bool {
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            if !child.is_named() && child.kind() == token {
                return true;
            }
        }
    }
    false
}

fn text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

fn lower_import(node: Node<'_>, source: &str, path: &str, out: &mut Lowering) -> Result<()> {
    // `import type { T } from 'm'` is type-only.
    if has_token(node, "type") || text(node, source).starts_with("import type ") {
        out.edits.push(Edit::Blank(node.start_byte(), node.end_byte()));
        return Ok(());
    }

    let spec = node
        .child_by_field_name("source")
        .map(|s| text(s, source).to_string())
        .ok_or_else(|| unsupported(path, node, "imports without a module source"))?;

    let clause = (0..node.named_child_count())
        .filter_map(|i| node.named_child(i))
        .find(|c| c.kind() == "import_clause");

    let replacement = match clause {
        // `import 'm';` for side effects only.
        None => format!("require({});", spec),
        Some(clause) => {
            let mut default_name: Option<String> = None;
            let mut namespace_name: Option<String> = None;
            let mut named: Vec<String> = Vec::new();

            let mut cursor = clause.walk();
            for part in clause.named_children(&mut cursor) {
                match part.kind() {
                    "identifier" => default_name = Some(text(part, source).to_string()),
                    "namespace_import" => {
                        namespace_name = part
                            .named_child(0)
                            .map(|ident| text(ident, source).to_string());
                    }
                    "named_imports" => {
                        let mut inner = part.walk();
                        for specifier in part.named_children(&mut inner) {
                            if specifier.kind() != "import_specifier" {
                                continue;
                            }
                            let name = specifier
                                .child_by_field_name("name")
                                .map(|n| text(n, source).to_string())
                                .unwrap_or_default();
                            match specifier.child_by_field_name("alias") {
                                Some(alias) => {
                                    named.push(format!("{}: {}", name, text(alias, source)))
                                }
                                None => named.push(name),
                            }
                        }
                    }
                    _ => {}
                }
            }

            match (default_name, namespace_name, named.is_empty()) {
                (Some(name), None, true) => {
                    format!("const {} = require({}).default;", name, spec)
                }
                (None, Some(name), true) => format!("const {} = require({});", name, spec),
                (None, None, false) => {
                    format!("const {{ {} }} = require({});", named.join(", "), spec)
                }
                (Some(name), None, false) => {
                    let temp = format!("__tgp_mod{}", out.temp_counter);
                    out.temp_counter += 1;
                    format!(
                        "const {temp} = require({spec}); const {name} = {temp}.default; const {{ {named} }} = {temp};",
                        temp = temp,
                        spec = spec,
                        name = name,
                        named = named.join(", ")
                    )
                }
                _ => return Err(unsupported(path, node, "this import form")),
            }
        }
    };

    out.edits
        .push(Edit::Replace(node.start_byte(), node.end_byte(), replacement));
    Ok(())
}

fn lower_export(node: Node<'_>, source: &str, path: &str, out: &mut Lowering) -> Result<()> {
    // Re-exports (`export ... from 'm'`, `export * from 'm'`) are not
    // needed by tools and stay unsupported.
    if node.child_by_field_name("source").is_some() {
        return Err(unsupported(path, node, "re-exports"));
    }

    let declaration = node
        .child_by_field_name("declaration")
        .or_else(|| node.child_by_field_name("value"));

    // `export type {...}` / exported interfaces and aliases are type-only.
    if has_token(node, "type")
        || text(node, source).starts_with("export type ")
        || declaration
            .map(|d| matches!(d.kind(), "interface_declaration" | "type_alias_declaration"))
            .unwrap_or(false)
    {
        out.edits.push(Edit::Blank(node.start_byte(), node.end_byte()));
        return Ok(());
    }

    if has_token(node, "default") {
        let value = declaration
            .ok_or_else(|| unsupported(path, node, "default exports without a value"))?;
        let name = value
            .child_by_field_name("name")
            .map(|n| text(n, source).to_string());

        match (value.kind(), name) {
            ("function_declaration" | "class_declaration" | "generator_function_declaration", Some(name)) => {
                // Strip `export default `, bind at the end of the module.
                out.edits
                    .push(Edit::Replace(node.start_byte(), value.start_byte(), String::new()));
                out.tail.push(format!("module.exports.default = {};", name));
            }
            _ => {
                out.edits.push(Edit::Replace(
                    node.start_byte(),
                    value.start_byte(),
                    "module.exports.default = ".to_string(),
                ));
            }
        }
        return Ok(());
    }

    if let Some(decl) = declaration {
        let mut names: Vec<String> = Vec::new();
        match decl.kind() {
            "function_declaration" | "class_declaration" | "generator_function_declaration" => {
                if let Some(name) = decl.child_by_field_name("name") {
                    names.push(text(name, source).to_string());
                }
            }
            "lexical_declaration" | "variable_declaration" => {
                let mut cursor = decl.walk();
                for declarator in decl.named_children(&mut cursor) {
                    if declarator.kind() != "variable_declarator" {
                        continue;
                    }
                    match declarator.child_by_field_name("name") {
                        Some(name) if name.kind() == "identifier" => {
                            names.push(text(name, source).to_string());
                        }
                        _ => return Err(unsupported(path, node, "destructured exports")),
                    }
                }
            }
            _ => return Err(unsupported(path, node, "this export form")),
        }

        out.edits
            .push(Edit::Replace(node.start_byte(), decl.start_byte(), String::new()));
        for name in names {
            out.tail.push(format!("exports.{} = {};", name, name));
        }
        return Ok(());
    }

    // `export { a, b as c };`
    let mut rewrites: Vec<String> = Vec::new();
    for i in 0..node.named_child_count() {
        let Some(clause) = node.named_child(i) else { continue };
        if clause.kind() != "export_clause" {
            continue;
        }
        let mut cursor = clause.walk();
        for specifier in clause.named_children(&mut cursor) {
            if specifier.kind() != "export_specifier" {
                continue;
            }
            let local = specifier
                .child_by_field_name("name")
                .map(|n| text(n, source).to_string())
                .unwrap_or_default();
            let exported = specifier
                .child_by_field_name("alias")
                .map(|a| text(a, source).to_string())
                .unwrap_or_else(|| local.clone());
            rewrites.push(format!("exports.{} = {};", exported, local));
        }
    }
    if rewrites.is_empty() {
        return Err(unsupported(path, node, "this export form"));
    }
    out.edits.push(Edit::Replace(
        node.start_byte(),
        node.end_byte(),
        rewrites.join(" "),
    ));
    Ok(())
}

fn apply(source: &str, mut lowering: Lowering) -> String {
    // Parents are visited before children, so on equal starts the wider
    // edit sorts first and inner edits are dropped as overlaps.
    lowering
        .edits
        .sort_by(|a, b| a.start().cmp(&b.start()).then(b.end().cmp(&a.end())));

    let bytes = source.as_bytes();
    let mut output = String::with_capacity(source.len());
    let mut position = 0usize;

    for edit in &lowering.edits {
        if edit.start() < position {
            continue;
        }
        output.push_str(&source[position..edit.start()]);
        match edit {
            Edit::Blank(start, end) => {
                for &byte in &bytes[*start..*end] {
                    output.push(if byte == b'\n' { '\n' } else { ' ' });
                }
            }
            Edit::Replace(_, _, replacement) => output.push_str(replacement),
        }
        position = edit.end();
    }
    output.push_str(&source[position..]);

    for line in &lowering.tail {
        output.push('\n');
        output.push_str(line);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> String {
        strip_types("tools/test.ts", source).expect("should compile")
    }

    #[test]
    fn erases_annotations_and_generics() {
        let out = compile("function add(a: number, b: number): number { return a + b; }");
        assert_eq!(out.replace("  ", " ").contains(": number"), false);
        assert!(out.contains("function add(a"));
    }

    #[test]
    fn erases_interfaces_and_aliases() {
        let out = compile("interface Args { n: number }\ntype N = number;\nconst x = 1;");
        assert!(!out.contains("interface"));
        assert!(!out.contains("type N"));
        assert!(out.contains("const x = 1;"));
    }

    #[test]
    fn lowers_default_export_of_named_function() {
        let out = compile("export default function fib(args: { n: number }) { return args.n; }");
        assert!(out.contains("function fib(args"));
        assert!(out.contains("module.exports.default = fib;"));
        assert!(!out.contains("export default"));
    }

    #[test]
    fn lowers_default_export_expression_inline() {
        let out = compile("export default (args) => args.n + 1;");
        assert!(out.contains("module.exports.default = (args) => args.n + 1;"));
    }

    #[test]
    fn lowers_named_exports() {
        let out = compile("export const version = 3;\nexport function helper() { return 1; }");
        assert!(out.contains("const version = 3;"));
        assert!(out.contains("exports.version = version;"));
        assert!(out.contains("exports.helper = helper;"));
    }

    #[test]
    fn lowers_default_import() {
        let out = compile("import multiply from './lib/multiplier';\nexport default () => multiply(2, 3);");
        assert!(out.contains("const multiply = require('./lib/multiplier').default;"));
    }

    #[test]
    fn lowers_named_and_namespace_imports() {
        let out = compile("import { a, b as c } from './m';\nimport * as all from './n';\nexport default () => a + c + all.x;");
        assert!(out.contains("const { a, b: c } = require('./m');"));
        assert!(out.contains("const all = require('./n');"));
    }

    #[test]
    fn erases_type_only_imports() {
        let out = compile("import type { Shape } from './shapes';\nexport default (s: unknown) => s;");
        assert!(!out.contains("require('./shapes')"));
    }

    #[test]
    fn keeps_as_cast_expression() {
        let out = compile("const n = (1 as unknown) as number;\nexport default () => n;");
        assert!(out.contains("const n = (1"));
        assert!(!out.contains(" as number"));
    }

    #[test]
    fn rejects_enums() {
        let err = strip_types("tools/e.ts", "enum Color { Red, Green }").expect_err("enums");
        assert!(matches!(err, KernelError::CompileError(_)));
        assert!(err.to_string().contains("enums"));
    }

    #[test]
    fn rejects_broken_syntax_with_location() {
        let err = strip_types("tools/bad.ts", "function (((").expect_err("syntax error");
        let msg = err.to_string();
        assert!(msg.contains("tools/bad.ts"));
        assert!(msg.contains("syntax error"));
    }

    #[test]
    fn doc_comments_survive_compilation() {
        let out = compile("/** Adds numbers. */\nexport default function add(a: number) { return a; }");
        assert!(out.contains("/** Adds numbers. */"));
    }
}
