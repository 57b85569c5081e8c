use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tree_sitter::{Language, Node, Parser};

use crate::ingest::IngestError;

// ---------------------------------------------------------------------------
// Code-element extraction for the `code-analysis` ingestion strategy.
//
// One analyzer per language, selected by file extension. Each analyzer walks
// the tree-sitter parse tree and reports namespaces, classes, methods,
// constructors, fields, vars, and macros, with docstrings and visibility.
// ---------------------------------------------------------------------------

/// One recognized code element. Serialized verbatim as the stored content of
/// its search segment.
#[derive(Debug, Clone, Serialize)]
pub struct CodeElement {
    pub file: String,
    pub language: String,
    #[serde(rename = "element-type")]
    pub element_type: String,
    pub name: String,
    #[serde(rename = "qualified-name")]
    pub qualified_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub visibility: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    pub line: usize,
}

trait LanguageAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;
    fn extensions(&self) -> &'static [&'static str];
    fn language(&self) -> Language;
    fn collect(&self, file: &str, source: &str, root: Node) -> Vec<CodeElement>;
}

struct AnalyzerTable {
    analyzers: Vec<Box<dyn LanguageAnalyzer>>,
    by_ext: HashMap<&'static str, usize>,
}

impl AnalyzerTable {
    fn for_extension(&self, ext: &str) -> Option<&dyn LanguageAnalyzer> {
        self.by_ext
            .get(ext)
            .and_then(|&i| self.analyzers.get(i))
            .map(|a| a.as_ref())
    }
}

fn analyzer_table() -> &'static AnalyzerTable {
    static TABLE: OnceLock<AnalyzerTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let analyzers: Vec<Box<dyn LanguageAnalyzer>> = vec![
            Box::new(RustAnalyzer),
            Box::new(PythonAnalyzer),
            Box::new(TypeScriptAnalyzer),
        ];
        let mut by_ext = HashMap::new();
        for (i, a) in analyzers.iter().enumerate() {
            for ext in a.extensions() {
                by_ext.insert(*ext, i);
            }
        }
        AnalyzerTable { analyzers, by_ext }
    })
}

/// Analyze `content` as the language implied by `file_id`'s extension.
pub fn extract_elements(file_id: &str, content: &str) -> Result<Vec<CodeElement>, IngestError> {
    let ext = file_id
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    let analyzer = analyzer_table().for_extension(ext.as_str()).ok_or_else(|| {
        IngestError::Analysis(format!("no analyzer for `.{ext}` files ({file_id})"))
    })?;

    let mut parser = Parser::new();
    parser
        .set_language(&analyzer.language())
        .map_err(|e| IngestError::Analysis(format!("tree-sitter language setup: {e}")))?;
    let tree = parser
        .parse(content, None)
        .ok_or_else(|| IngestError::Analysis(format!("failed to parse {file_id}")))?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(IngestError::Analysis(format!(
            "{file_id} does not parse as {}",
            analyzer.name()
        )));
    }

    Ok(analyzer.collect(file_id, content, root))
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn node_text<'a>(source: &'a str, node: Node) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

fn field_text(source: &str, node: Node, field: &str) -> Option<String> {
    node.child_by_field_name(field)
        .map(|n| node_text(source, n).to_string())
}

fn line_of(node: Node) -> usize {
    node.start_position().row + 1
}

/// Collect a contiguous run of `///` line comments (or one `/** */` block)
/// directly above `node`, skipping attribute items.
fn rust_doc(source: &str, node: Node) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current = node.prev_sibling();
    while let Some(prev) = current {
        match prev.kind() {
            "attribute_item" => {}
            "line_comment" => {
                let text = node_text(source, prev);
                match text.strip_prefix("///") {
                    Some(rest) => lines.push(rest.trim().to_string()),
                    None => break,
                }
            }
            "block_comment" => {
                let text = node_text(source, prev);
                if let Some(inner) = text.strip_prefix("/**").and_then(|t| t.strip_suffix("*/")) {
                    lines.push(clean_block_comment(inner));
                }
                break;
            }
            _ => break,
        }
        current = prev.prev_sibling();
    }
    if lines.is_empty() {
        return None;
    }
    lines.reverse();
    Some(lines.join("\n"))
}

fn clean_block_comment(inner: &str) -> String {
    inner
        .lines()
        .map(|l| l.trim().trim_start_matches('*').trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// JSDoc-style `/** */` comment directly above `node`. For exported
/// declarations the comment sits above the wrapping export statement.
fn jsdoc(source: &str, node: Node) -> Option<String> {
    let anchor = match node.parent() {
        Some(parent) if parent.kind() == "export_statement" => parent,
        _ => node,
    };
    let prev = anchor.prev_sibling()?;
    if prev.kind() != "comment" {
        return None;
    }
    let text = node_text(source, prev);
    let inner = text.strip_prefix("/**")?.strip_suffix("*/")?;
    let cleaned = clean_block_comment(inner);
    (!cleaned.is_empty()).then_some(cleaned)
}

fn join_path(namespace: &[String], name: &str, separator: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}{separator}{name}", namespace.join(separator))
    }
}

fn namespace_of(namespace: &[String], separator: &str) -> Option<String> {
    (!namespace.is_empty()).then(|| namespace.join(separator))
}

// ---------------------------------------------------------------------------
// Rust
// ---------------------------------------------------------------------------

struct RustAnalyzer;

impl RustAnalyzer {
    #[allow(clippy::too_many_arguments)]
    fn element(
        &self,
        file: &str,
        source: &str,
        node: Node,
        element_type: &str,
        name: &str,
        namespace: &[String],
        owner: Option<&str>,
        public: bool,
    ) -> CodeElement {
        let local = match owner {
            Some(owner) => format!("{owner}::{name}"),
            None => name.to_string(),
        };
        CodeElement {
            file: file.to_string(),
            language: "rust".to_string(),
            element_type: element_type.to_string(),
            name: name.to_string(),
            qualified_name: join_path(namespace, &local, "::"),
            namespace: namespace_of(namespace, "::"),
            visibility: if public { "public" } else { "private" }.to_string(),
            doc: rust_doc(source, node),
            line: line_of(node),
        }
    }

    fn walk(
        &self,
        file: &str,
        source: &str,
        node: Node,
        namespace: &mut Vec<String>,
        out: &mut Vec<CodeElement>,
    ) {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "mod_item" => {
                    let Some(name) = field_text(source, child, "name") else {
                        continue;
                    };
                    let public = rust_is_public(source, child);
                    out.push(self.element(
                        file, source, child, "namespace", &name, namespace, None, public,
                    ));
                    if let Some(body) = child.child_by_field_name("body") {
                        namespace.push(name);
                        self.walk(file, source, body, namespace, out);
                        namespace.pop();
                    }
                }
                "struct_item" | "enum_item" | "trait_item" | "union_item" => {
                    let Some(name) = field_text(source, child, "name") else {
                        continue;
                    };
                    let public = rust_is_public(source, child);
                    out.push(self.element(
                        file, source, child, "class", &name, namespace, None, public,
                    ));
                    if child.kind() == "struct_item" {
                        self.fields(file, source, child, &name, namespace, out);
                    }
                    if child.kind() == "trait_item" {
                        if let Some(body) = child.child_by_field_name("body") {
                            self.methods(file, source, body, &name, namespace, out);
                        }
                    }
                }
                "impl_item" => {
                    let owner = child
                        .child_by_field_name("type")
                        .map(|n| node_text(source, n).to_string());
                    if let Some(body) = child.child_by_field_name("body") {
                        self.methods(
                            file,
                            source,
                            body,
                            owner.as_deref().unwrap_or(""),
                            namespace,
                            out,
                        );
                    }
                }
                "function_item" => {
                    let Some(name) = field_text(source, child, "name") else {
                        continue;
                    };
                    let public = rust_is_public(source, child);
                    out.push(self.element(
                        file, source, child, "method", &name, namespace, None, public,
                    ));
                }
                "const_item" | "static_item" => {
                    let Some(name) = field_text(source, child, "name") else {
                        continue;
                    };
                    let public = rust_is_public(source, child);
                    out.push(self.element(
                        file, source, child, "var", &name, namespace, None, public,
                    ));
                }
                "macro_definition" => {
                    let Some(name) = field_text(source, child, "name") else {
                        continue;
                    };
                    // macro_rules! has no visibility modifier; exported macros
                    // carry #[macro_export] instead.
                    let public = rust_has_macro_export(source, child) || rust_is_public(source, child);
                    out.push(self.element(
                        file, source, child, "macro", &name, namespace, None, public,
                    ));
                }
                _ => {}
            }
        }
    }

    fn methods(
        &self,
        file: &str,
        source: &str,
        body: Node,
        owner: &str,
        namespace: &[String],
        out: &mut Vec<CodeElement>,
    ) {
        let mut cursor = body.walk();
        for member in body.named_children(&mut cursor) {
            if !matches!(member.kind(), "function_item" | "function_signature_item") {
                continue;
            }
            let Some(name) = field_text(source, member, "name") else {
                continue;
            };
            let element_type = if name == "new" { "constructor" } else { "method" };
            let public = rust_is_public(source, member);
            let owner = (!owner.is_empty()).then_some(owner);
            out.push(self.element(
                file,
                source,
                member,
                element_type,
                &name,
                namespace,
                owner,
                public,
            ));
        }
    }

    fn fields(
        &self,
        file: &str,
        source: &str,
        struct_node: Node,
        owner: &str,
        namespace: &[String],
        out: &mut Vec<CodeElement>,
    ) {
        let Some(body) = struct_node.child_by_field_name("body") else {
            return;
        };
        if body.kind() != "field_declaration_list" {
            return;
        }
        let mut cursor = body.walk();
        for member in body.named_children(&mut cursor) {
            if member.kind() != "field_declaration" {
                continue;
            }
            let Some(name) = field_text(source, member, "name") else {
                continue;
            };
            let public = rust_is_public(source, member);
            out.push(self.element(
                file,
                source,
                member,
                "field",
                &name,
                namespace,
                Some(owner),
                public,
            ));
        }
    }
}

fn rust_has_macro_export(source: &str, node: Node) -> bool {
    let mut current = node.prev_sibling();
    while let Some(prev) = current {
        match prev.kind() {
            "attribute_item" => {
                if node_text(source, prev).contains("macro_export") {
                    return true;
                }
            }
            "line_comment" | "block_comment" => {}
            _ => break,
        }
        current = prev.prev_sibling();
    }
    false
}

fn rust_is_public(source: &str, node: Node) -> bool {
    let mut cursor = node.walk();
    let result = node
        .children(&mut cursor)
        .any(|c| c.kind() == "visibility_modifier" && node_text(source, c).starts_with("pub"));
    result
}

impl LanguageAnalyzer for RustAnalyzer {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn language(&self) -> Language {
        tree_sitter_rust::LANGUAGE.into()
    }

    fn collect(&self, file: &str, source: &str, root: Node) -> Vec<CodeElement> {
        let mut out = Vec::new();
        let mut namespace = Vec::new();
        self.walk(file, source, root, &mut namespace, &mut out);
        out
    }
}

// ---------------------------------------------------------------------------
// Python
// ---------------------------------------------------------------------------

struct PythonAnalyzer;

impl PythonAnalyzer {
    fn element(
        &self,
        file: &str,
        element_type: &str,
        name: &str,
        owner: Option<&str>,
        doc: Option<String>,
        line: usize,
    ) -> CodeElement {
        let qualified = match owner {
            Some(owner) => format!("{owner}.{name}"),
            None => name.to_string(),
        };
        CodeElement {
            file: file.to_string(),
            language: "python".to_string(),
            element_type: element_type.to_string(),
            name: name.to_string(),
            qualified_name: qualified,
            namespace: owner.map(|o| o.to_string()),
            visibility: if name.starts_with('_') && name != "__init__" {
                "private"
            } else {
                "public"
            }
            .to_string(),
            doc,
            line,
        }
    }

    fn walk(&self, file: &str, source: &str, node: Node, out: &mut Vec<CodeElement>) {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            let item = if child.kind() == "decorated_definition" {
                match child.child_by_field_name("definition") {
                    Some(def) => def,
                    None => continue,
                }
            } else {
                child
            };
            match item.kind() {
                "class_definition" => {
                    let Some(name) = field_text(source, item, "name") else {
                        continue;
                    };
                    let doc = py_docstring(source, item);
                    out.push(self.element(file, "class", &name, None, doc, line_of(item)));
                    if let Some(body) = item.child_by_field_name("body") {
                        self.class_members(file, source, body, &name, out);
                    }
                }
                "function_definition" => {
                    let Some(name) = field_text(source, item, "name") else {
                        continue;
                    };
                    let doc = py_docstring(source, item);
                    out.push(self.element(file, "method", &name, None, doc, line_of(item)));
                }
                "expression_statement" => {
                    if let Some(assign) = item.named_child(0).filter(|n| n.kind() == "assignment") {
                        if let Some(left) = assign
                            .child_by_field_name("left")
                            .filter(|n| n.kind() == "identifier")
                        {
                            let name = node_text(source, left).to_string();
                            out.push(self.element(file, "var", &name, None, None, line_of(item)));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn class_members(
        &self,
        file: &str,
        source: &str,
        body: Node,
        class_name: &str,
        out: &mut Vec<CodeElement>,
    ) {
        let mut cursor = body.walk();
        for child in body.named_children(&mut cursor) {
            let item = if child.kind() == "decorated_definition" {
                match child.child_by_field_name("definition") {
                    Some(def) => def,
                    None => continue,
                }
            } else {
                child
            };
            match item.kind() {
                "function_definition" => {
                    let Some(name) = field_text(source, item, "name") else {
                        continue;
                    };
                    let element_type = if name == "__init__" { "constructor" } else { "method" };
                    let doc = py_docstring(source, item);
                    out.push(self.element(
                        file,
                        element_type,
                        &name,
                        Some(class_name),
                        doc,
                        line_of(item),
                    ));
                }
                "expression_statement" => {
                    if let Some(assign) = item.named_child(0).filter(|n| n.kind() == "assignment") {
                        if let Some(left) = assign
                            .child_by_field_name("left")
                            .filter(|n| n.kind() == "identifier")
                        {
                            let name = node_text(source, left).to_string();
                            out.push(self.element(
                                file,
                                "field",
                                &name,
                                Some(class_name),
                                None,
                                line_of(item),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// First statement of a definition body, when it is a bare string literal.
fn py_docstring(source: &str, definition: Node) -> Option<String> {
    let body = definition.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string = first.named_child(0).filter(|n| n.kind() == "string")?;
    let raw = node_text(source, string);
    Some(strip_py_string(raw))
}

fn strip_py_string(raw: &str) -> String {
    let raw = raw.trim_start_matches(['r', 'b', 'u', 'f', 'R', 'B', 'U', 'F']);
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(inner) = raw
            .strip_prefix(quote)
            .and_then(|r| r.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    raw.trim().to_string()
}

impl LanguageAnalyzer for PythonAnalyzer {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn language(&self) -> Language {
        tree_sitter_python::LANGUAGE.into()
    }

    fn collect(&self, file: &str, source: &str, root: Node) -> Vec<CodeElement> {
        let mut out = Vec::new();
        self.walk(file, source, root, &mut out);
        out
    }
}

// ---------------------------------------------------------------------------
// TypeScript
// ---------------------------------------------------------------------------

struct TypeScriptAnalyzer;

impl TypeScriptAnalyzer {
    #[allow(clippy::too_many_arguments)]
    fn element(
        &self,
        file: &str,
        source: &str,
        node: Node,
        element_type: &str,
        name: &str,
        namespace: &[String],
        owner: Option<&str>,
        public: bool,
    ) -> CodeElement {
        let local = match owner {
            Some(owner) => format!("{owner}.{name}"),
            None => name.to_string(),
        };
        CodeElement {
            file: file.to_string(),
            language: "typescript".to_string(),
            element_type: element_type.to_string(),
            name: name.to_string(),
            qualified_name: join_path(namespace, &local, "."),
            namespace: namespace_of(namespace, "."),
            visibility: if public { "public" } else { "private" }.to_string(),
            doc: jsdoc(source, node),
            line: line_of(node),
        }
    }

    fn walk(
        &self,
        file: &str,
        source: &str,
        node: Node,
        namespace: &mut Vec<String>,
        exported: bool,
        out: &mut Vec<CodeElement>,
    ) {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "export_statement" => {
                    if let Some(decl) = child.child_by_field_name("declaration") {
                        self.declaration(file, source, decl, namespace, true, out);
                    }
                }
                _ => self.declaration(file, source, child, namespace, exported, out),
            }
        }
    }

    fn declaration(
        &self,
        file: &str,
        source: &str,
        node: Node,
        namespace: &mut Vec<String>,
        exported: bool,
        out: &mut Vec<CodeElement>,
    ) {
        match node.kind() {
            "internal_module" | "module" => {
                let Some(name) = field_text(source, node, "name") else {
                    return;
                };
                out.push(self.element(
                    file, source, node, "namespace", &name, namespace, None, exported,
                ));
                if let Some(body) = node.child_by_field_name("body") {
                    namespace.push(name);
                    self.walk(file, source, body, namespace, exported, out);
                    namespace.pop();
                }
            }
            "class_declaration" | "abstract_class_declaration" | "interface_declaration"
            | "enum_declaration" => {
                let Some(name) = field_text(source, node, "name") else {
                    return;
                };
                out.push(self.element(
                    file, source, node, "class", &name, namespace, None, exported,
                ));
                if let Some(body) = node.child_by_field_name("body") {
                    self.class_members(file, source, body, &name, namespace, out);
                }
            }
            "function_declaration" => {
                let Some(name) = field_text(source, node, "name") else {
                    return;
                };
                out.push(self.element(
                    file, source, node, "method", &name, namespace, None, exported,
                ));
            }
            "lexical_declaration" | "variable_declaration" => {
                let mut cursor = node.walk();
                for declarator in node.named_children(&mut cursor) {
                    if declarator.kind() != "variable_declarator" {
                        continue;
                    }
                    let Some(name) = field_text(source, declarator, "name") else {
                        continue;
                    };
                    out.push(self.element(
                        file, source, node, "var", &name, namespace, None, exported,
                    ));
                }
            }
            _ => {}
        }
    }

    fn class_members(
        &self,
        file: &str,
        source: &str,
        body: Node,
        class_name: &str,
        namespace: &[String],
        out: &mut Vec<CodeElement>,
    ) {
        let mut cursor = body.walk();
        for member in body.named_children(&mut cursor) {
            match member.kind() {
                "method_definition" => {
                    let Some(name) = field_text(source, member, "name") else {
                        continue;
                    };
                    let element_type = if name == "constructor" { "constructor" } else { "method" };
                    out.push(self.element(
                        file,
                        source,
                        member,
                        element_type,
                        &name,
                        namespace,
                        Some(class_name),
                        ts_member_is_public(source, member),
                    ));
                }
                "public_field_definition" | "property_signature" => {
                    let Some(name) = field_text(source, member, "name") else {
                        continue;
                    };
                    out.push(self.element(
                        file,
                        source,
                        member,
                        "field",
                        &name,
                        namespace,
                        Some(class_name),
                        ts_member_is_public(source, member),
                    ));
                }
                _ => {}
            }
        }
    }
}

fn ts_member_is_public(source: &str, member: Node) -> bool {
    let mut cursor = member.walk();
    let result = !member.children(&mut cursor).any(|c| {
        c.kind() == "accessibility_modifier"
            && matches!(node_text(source, c), "private" | "protected")
    });
    result
}

impl LanguageAnalyzer for TypeScriptAnalyzer {
    fn name(&self) -> &'static str {
        "typescript"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ts", "tsx", "mts", "cts"]
    }

    fn language(&self) -> Language {
        tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
    }

    fn collect(&self, file: &str, source: &str, root: Node) -> Vec<CodeElement> {
        let mut out = Vec::new();
        let mut namespace = Vec::new();
        self.walk(file, source, root, &mut namespace, false, &mut out);
        out
    }
}
