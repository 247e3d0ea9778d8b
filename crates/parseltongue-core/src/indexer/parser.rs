//! Tolerant source parser.
//!
//! Wraps tree-sitter's error recovery so that malformed, partial or binary
//! input never fails: definitions outside error regions come back with
//! `Confidence::High`, definitions touching an error region with
//! `Confidence::Low`, and anything unrecoverable becomes a diagnostic.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tree_sitter::Node;

use crate::config::DEFAULT_MAX_PARSE_DEPTH;
use crate::indexer::languages::{detect_language, LanguageSpec, TYPE_NAME_KINDS};
use crate::models::{
    sha256_hex, short_name, Confidence, EdgeKind, EntityKind, Parameter, Span, TypeDetail,
    Visibility,
};

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_BYTES: usize = 8000;

const MAX_SIGNATURE_CHARS: usize = 400;

// ---------------------------------------------------------------------------
// Parse output
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseRecoveryNote {
    /// The definition sits inside an `ERROR` node.
    InsideErrorRegion,
    /// The definition's own subtree contains error or missing nodes.
    ContainsErrors,
    /// Only a keyword and a name were recoverable.
    Salvaged,
    /// Descent stopped at the configured nesting limit.
    DepthLimit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseDiagnostic {
    pub line: Option<u32>,
    pub message: String,
}

/// A syntactic reference made from inside an entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawReference {
    pub kind: EdgeKind,
    pub name: String,
    pub line: u32,
}

/// One imported name, e.g. `use a::b::c as d` gives path `a::b::c`, local `d`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImport {
    pub path: String,
    pub local_name: String,
    pub line: u32,
    /// Index of the enclosing entity, `None` at file level.
    pub owner: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEntity {
    pub kind: EntityKind,
    pub name: String,
    pub qualified_name: String,
    /// Index of the innermost enclosing entity in the same file.
    pub parent: Option<usize>,
    /// Qualified name of the type an impl block or method belongs to.
    pub owner: Option<String>,
    pub byte_range: Range<usize>,
    pub span: Span,
    pub signature_text: Option<String>,
    pub body_hash: String,
    pub visibility: Visibility,
    pub is_test: bool,
    pub confidence: Confidence,
    pub type_detail: Option<TypeDetail>,
    pub references: Vec<RawReference>,
    pub notes: Vec<ParseRecoveryNote>,
}

impl RawEntity {
    fn mark_low(&mut self, note: ParseRecoveryNote) {
        self.confidence = Confidence::Low;
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedFile {
    pub language: String,
    /// Entities in source order.
    pub entities: Vec<RawEntity>,
    pub imports: Vec<RawImport>,
    pub diagnostics: Vec<ParseDiagnostic>,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

pub struct TolerantParser {
    spec: &'static LanguageSpec,
    max_depth: usize,
}

impl TolerantParser {
    pub fn new(spec: &'static LanguageSpec) -> Self {
        Self {
            spec,
            max_depth: DEFAULT_MAX_PARSE_DEPTH,
        }
    }

    pub fn for_path(path: &str) -> Option<Self> {
        detect_language(path).map(Self::new)
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    pub fn language(&self) -> &'static LanguageSpec {
        self.spec
    }

    pub fn parse(&self, file_bytes: &[u8]) -> ParsedFile {
        self.parse_with_path(file_bytes, None)
    }

    /// Parse with the file path available for path-based test detection.
    pub fn parse_with_path(&self, file_bytes: &[u8], path: Option<&str>) -> ParsedFile {
        let mut parsed = ParsedFile {
            language: self.spec.name.to_string(),
            ..ParsedFile::default()
        };
        if file_bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return parsed;
        }
        let sniff = &file_bytes[..file_bytes.len().min(BINARY_SNIFF_BYTES)];
        if sniff.contains(&0) {
            parsed.diagnostics.push(ParseDiagnostic {
                line: None,
                message: "binary content skipped".to_string(),
            });
            return parsed;
        }

        let mut ts_parser = tree_sitter::Parser::new();
        if let Err(e) = ts_parser.set_language(&self.spec.grammar()) {
            parsed.diagnostics.push(ParseDiagnostic {
                line: None,
                message: format!("grammar unavailable: {e}"),
            });
            return parsed;
        }
        let Some(tree) = ts_parser.parse(file_bytes, None) else {
            parsed.diagnostics.push(ParseDiagnostic {
                line: None,
                message: "parser produced no tree".to_string(),
            });
            return parsed;
        };

        let root = tree.root_node();
        let mut walker = Walker {
            spec: self.spec,
            src: file_bytes,
            path,
            max_depth: self.max_depth,
            entities: Vec::new(),
            imports: Vec::new(),
            diagnostics: Vec::new(),
            scope: Vec::new(),
            stack: Vec::new(),
            generics: Vec::new(),
            error_depth: 0,
        };
        walker.visit(root, 0);

        if root.has_error() {
            let line = first_error_line(root);
            let message = if walker.entities.is_empty() {
                "syntax errors with no recoverable definitions".to_string()
            } else {
                "syntax errors recovered".to_string()
            };
            walker.diagnostics.push(ParseDiagnostic { line, message });
        }

        parsed.entities = walker.entities;
        parsed.imports = walker.imports;
        parsed.diagnostics.extend(walker.diagnostics);
        parsed
    }
}

/// Line of the first error or missing node, iteratively.
fn first_error_line(root: Node<'_>) -> Option<u32> {
    let mut pending = vec![root];
    while let Some(node) = pending.pop() {
        if node.is_error() || node.is_missing() {
            return Some(node.start_position().row as u32 + 1);
        }
        if !node.has_error() {
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        pending.extend(children.into_iter().rev());
    }
    None
}

fn span_of(node: Node<'_>) -> Span {
    let start = node.start_position();
    let end = node.end_position();
    Span {
        start_line: start.row as u32 + 1,
        start_col: start.column as u32,
        end_line: end.row as u32 + 1,
        end_col: end.column as u32,
    }
}

fn slice_text(src: &[u8], range: Range<usize>) -> String {
    src.get(range)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

/// True for `#[test]`, `#[tokio::test]` and the like, and for `#[cfg(..)]`
/// whose predicate names `test` outside a `not(..)`. String literals inside
/// the attribute never count.
fn is_test_attribute(text: &str) -> bool {
    let body = text
        .trim()
        .trim_start_matches("#!")
        .trim_start_matches('#')
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']');
    let path_end = body.find(['(', '=']).unwrap_or(body.len());
    let path: String = body[..path_end].chars().filter(|c| !c.is_whitespace()).collect();
    if path == "test" || path.ends_with("::test") {
        return true;
    }
    if path != "cfg" {
        return false;
    }

    // Blank out string literals, then look for a bare `test` identifier.
    let mut args = String::with_capacity(body.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in body[path_end..].chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c.is_whitespace() => {}
            c => args.push(c),
        }
    }
    if args.contains("not(test") {
        return false;
    }
    args.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|ident| ident == "test")
}

/// Drop generic arguments and reference sigils from a type's text.
pub fn strip_type_text(text: &str) -> String {
    let cut = text
        .find(|c| c == '<' || c == '[' || c == '(')
        .map(|i| &text[..i])
        .unwrap_or(text);
    let trimmed = cut
        .trim()
        .trim_start_matches('&')
        .trim_start_matches('*')
        .trim();
    let trimmed = trimmed.strip_prefix("mut ").unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix("dyn ").unwrap_or(trimmed);
    trimmed.split_whitespace().collect::<Vec<_>>().join("")
}

fn is_identifier_like(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == ':' || c == '.' || c == '$')
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

struct Walker<'a> {
    spec: &'static LanguageSpec,
    src: &'a [u8],
    path: Option<&'a str>,
    max_depth: usize,
    entities: Vec<RawEntity>,
    imports: Vec<RawImport>,
    diagnostics: Vec<ParseDiagnostic>,
    scope: Vec<String>,
    /// Indices of enclosing entities, innermost last.
    stack: Vec<usize>,
    /// Generic parameter names declared by the enclosing entities.
    generics: Vec<Vec<String>>,
    error_depth: usize,
}

impl<'a> Walker<'a> {
    fn text(&self, node: Node<'_>) -> String {
        slice_text(self.src, node.byte_range())
    }

    fn current(&self) -> Option<usize> {
        self.stack.last().copied()
    }

    fn qualify(&self, name: &str) -> String {
        if self.scope.is_empty() {
            name.to_string()
        } else {
            format!("{}{}{}", self.scope.join(self.spec.separator), self.spec.separator, name)
        }
    }

    fn visit(&mut self, node: Node<'_>, depth: usize) {
        if depth > self.max_depth {
            self.note_depth_limit(node);
            return;
        }
        let is_error = node.is_error();
        if is_error {
            self.error_depth += 1;
            self.salvage(node);
        }

        let kind = node.kind();
        let handled = match self.definition_kind(node) {
            Some(entity_kind) => self.enter_definition(node, entity_kind, depth),
            None => false,
        };
        if !handled {
            if self.spec.implements_kinds.contains(&kind) {
                self.record_types(node, EdgeKind::Implements);
            } else if self.spec.is_import(kind) {
                self.record_import(node);
            } else if self.spec.is_type_ref(kind) && self.record_type_ref(node) {
                // leaf reference, nothing below it to attribute
            } else {
                if let Some(field) = self.spec.callee_field(kind) {
                    self.record_call(node, field);
                }
                self.visit_children(node, depth, &[]);
            }
        }

        if is_error {
            self.error_depth -= 1;
        }
    }

    fn visit_children(&mut self, node: Node<'_>, depth: usize, skip: &[usize]) {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
        for child in children {
            if skip.contains(&child.id()) {
                continue;
            }
            self.visit(child, depth + 1);
        }
    }

    fn note_depth_limit(&mut self, node: Node<'_>) {
        match self.current() {
            Some(idx) => self.entities[idx].mark_low(ParseRecoveryNote::DepthLimit),
            None => {
                let already = self
                    .diagnostics
                    .iter()
                    .any(|d| d.message.starts_with("nesting depth limit"));
                if !already {
                    self.diagnostics.push(ParseDiagnostic {
                        line: Some(node.start_position().row as u32 + 1),
                        message: format!("nesting depth limit {} reached", self.max_depth),
                    });
                }
            }
        }
    }

    // -- definitions --------------------------------------------------------

    fn definition_kind(&self, node: Node<'_>) -> Option<EntityKind> {
        let kind = self.spec.definition_kind(node.kind())?;
        let refined = match (self.spec.name, node.kind()) {
            ("go", "type_spec") => match node.child_by_field_name("type").map(|t| t.kind()) {
                Some("struct_type") => EntityKind::Struct,
                Some("interface_type") => EntityKind::Interface,
                _ => EntityKind::TypeAlias,
            },
            ("typescript", "variable_declarator") => {
                let value = node.child_by_field_name("value")?;
                if !matches!(
                    value.kind(),
                    "arrow_function" | "function_expression" | "function"
                ) {
                    return None;
                }
                EntityKind::Function
            }
            _ => kind,
        };
        if refined == EntityKind::Function {
            let parent_holds_methods = self
                .current()
                .map(|idx| self.entities[idx].kind.holds_methods())
                .unwrap_or(false);
            if parent_holds_methods {
                return Some(EntityKind::Method);
            }
        }
        Some(refined)
    }

    /// Returns `false` when the node turns out not to name a definition.
    fn enter_definition(&mut self, node: Node<'_>, kind: EntityKind, depth: usize) -> bool {
        let parent = self.current();
        let separator = self.spec.separator;

        let (name, qualified_name, scope_segment, owner) = if kind == EntityKind::ImplBlock {
            let Some(self_ty) = node.child_by_field_name("type") else {
                return false;
            };
            let ty = strip_type_text(&self.text(self_ty));
            if ty.is_empty() {
                return false;
            }
            let name = match node.child_by_field_name("trait") {
                Some(t) => format!("impl {} for {}", strip_type_text(&self.text(t)), ty),
                None => format!("impl {ty}"),
            };
            let owner = if ty.contains("::") {
                ty.trim_start_matches("crate::")
                    .trim_start_matches("self::")
                    .to_string()
            } else {
                self.qualify(&ty)
            };
            let segment = short_name(&ty).to_string();
            (name.clone(), self.qualify(&name), segment, Some(owner))
        } else {
            let Some(name_node) = node.child_by_field_name("name") else {
                return false;
            };
            let name = self.text(name_node).trim().to_string();
            if name.is_empty() {
                return false;
            }
            if self.spec.name == "go" && node.kind() == "method_declaration" {
                let receiver = node
                    .child_by_field_name("receiver")
                    .and_then(|r| go_receiver_type(r, self.src));
                match receiver {
                    Some(recv) => {
                        let qualified = format!("{recv}{separator}{name}");
                        (name, qualified.clone(), qualified, Some(recv))
                    }
                    None => (name.clone(), self.qualify(&name), name, None),
                }
            } else {
                let owner = parent.and_then(|idx| {
                    let p = &self.entities[idx];
                    if p.kind == EntityKind::ImplBlock {
                        p.owner.clone()
                    } else {
                        None
                    }
                });
                (name.clone(), self.qualify(&name), name, owner)
            }
        };

        let generics = self.generic_names(node);
        let mut notes = Vec::new();
        if self.error_depth > 0 {
            notes.push(ParseRecoveryNote::InsideErrorRegion);
        }
        if node.has_error() {
            notes.push(ParseRecoveryNote::ContainsErrors);
        }
        let confidence = if notes.is_empty() {
            Confidence::High
        } else {
            Confidence::Low
        };
        let inherited_test = parent.map(|idx| self.entities[idx].is_test).unwrap_or(false);

        let entity = RawEntity {
            kind: kind.clone(),
            name: name.clone(),
            qualified_name,
            parent,
            owner,
            byte_range: node.byte_range(),
            span: span_of(node),
            signature_text: self.signature_text(node),
            body_hash: sha256_hex(self.src.get(node.byte_range()).unwrap_or_default()),
            visibility: self.visibility(node, &name, parent),
            is_test: inherited_test || self.is_test_definition(node, &kind, &name),
            confidence,
            type_detail: self.type_detail(node, &kind, &generics),
            references: Vec::new(),
            notes,
        };
        let idx = self.entities.len();
        self.entities.push(entity);

        let mut skip: Vec<usize> = Vec::new();
        if let Some(n) = node.child_by_field_name("name") {
            skip.push(n.id());
        }
        if let Some(tp) = node.child_by_field_name("type_parameters") {
            skip.push(tp.id());
        }
        for field in self.spec.implements_fields {
            if let Some(target) = node.child_by_field_name(field) {
                skip.push(target.id());
                self.stack.push(idx);
                self.record_types(target, EdgeKind::Implements);
                self.stack.pop();
            }
        }

        self.stack.push(idx);
        self.scope.push(scope_segment);
        self.generics.push(generics);
        self.visit_children(node, depth, &skip);
        self.generics.pop();
        self.scope.pop();
        self.stack.pop();
        true
    }

    /// Recover `keyword name` pairs left as loose tokens inside an error node.
    fn salvage(&mut self, error_node: Node<'_>) {
        let mut cursor = error_node.walk();
        let children: Vec<Node<'_>> = error_node.children(&mut cursor).collect();
        for (i, token) in children.iter().enumerate() {
            if token.is_named() {
                continue;
            }
            let Some(kind) = self.spec.recovery_kind(token.kind()) else {
                continue;
            };
            let Some(name_node) = children.get(i + 1).filter(|n| {
                matches!(
                    n.kind(),
                    "identifier" | "type_identifier" | "property_identifier"
                )
            }) else {
                continue;
            };
            let name = self.text(*name_node);
            if name.is_empty() {
                continue;
            }
            let range = token.start_byte()..error_node.end_byte();
            let mut span = span_of(*token);
            let name_end = name_node.end_position();
            span.end_line = name_end.row as u32 + 1;
            span.end_col = name_end.column as u32;
            let parent = self.current();
            let inherited_test = parent.map(|idx| self.entities[idx].is_test).unwrap_or(false);
            let in_method_holder = parent
                .map(|p| self.entities[p].kind.holds_methods())
                .unwrap_or(false);
            let kind = if kind == EntityKind::Function && in_method_holder {
                EntityKind::Method
            } else {
                kind
            };
            self.entities.push(RawEntity {
                kind,
                name: name.clone(),
                qualified_name: self.qualify(&name),
                parent,
                owner: None,
                byte_range: range.clone(),
                span,
                signature_text: None,
                body_hash: sha256_hex(self.src.get(range).unwrap_or_default()),
                visibility: self.spec.default_visibility(&name),
                is_test: inherited_test,
                confidence: Confidence::Low,
                type_detail: None,
                references: Vec::new(),
                notes: vec![
                    ParseRecoveryNote::InsideErrorRegion,
                    ParseRecoveryNote::Salvaged,
                ],
            });
        }
    }

    fn signature_text(&self, node: Node<'_>) -> Option<String> {
        let body = node.child_by_field_name("body").or_else(|| {
            node.child_by_field_name("value")
                .and_then(|v| v.child_by_field_name("body"))
        });
        let end = body.map(|b| b.start_byte()).unwrap_or_else(|| node.end_byte());
        let raw = slice_text(self.src, node.start_byte()..end);
        let raw = if body.is_none() {
            raw.split('{').next().unwrap_or_default().to_string()
        } else {
            raw
        };
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let trimmed = collapsed
            .trim_end_matches(|c| c == '{' || c == ';' || c == ':' || c == ' ')
            .trim()
            .to_string();
        if trimmed.is_empty() {
            return None;
        }
        Some(trimmed.chars().take(MAX_SIGNATURE_CHARS).collect())
    }

    fn visibility(&self, node: Node<'_>, name: &str, parent: Option<usize>) -> Visibility {
        let parent_kind = parent.map(|idx| &self.entities[idx].kind);
        match self.spec.name {
            "rust" => {
                let mut cursor = node.walk();
                let modifier = node
                    .children(&mut cursor)
                    .find(|c| c.kind() == "visibility_modifier");
                match modifier.map(|m| self.text(m)) {
                    Some(text) if text.trim() == "pub" => Visibility::Public,
                    Some(text) if text.contains("crate") => Visibility::Crate,
                    Some(_) => Visibility::Restricted,
                    None if parent_kind == Some(&EntityKind::Trait) => Visibility::Public,
                    None => Visibility::Private,
                }
            }
            "java" => {
                let mut cursor = node.walk();
                let modifiers = node
                    .children(&mut cursor)
                    .find(|c| c.kind() == "modifiers")
                    .map(|m| self.text(m))
                    .unwrap_or_default();
                let words: Vec<&str> = modifiers.split_whitespace().collect();
                if words.contains(&"public") || parent_kind == Some(&EntityKind::Interface) {
                    Visibility::Public
                } else if words.contains(&"private") {
                    Visibility::Private
                } else if words.contains(&"protected") {
                    Visibility::Restricted
                } else {
                    Visibility::Crate
                }
            }
            "typescript" => {
                let mut cursor = node.walk();
                let accessibility = node
                    .children(&mut cursor)
                    .find(|c| c.kind() == "accessibility_modifier")
                    .map(|m| self.text(m));
                match accessibility.as_deref() {
                    Some("private") => Visibility::Private,
                    Some("protected") => Visibility::Restricted,
                    Some(_) => Visibility::Public,
                    None if parent_kind.is_some() => Visibility::Public,
                    None if is_exported(node) => Visibility::Public,
                    None => Visibility::Private,
                }
            }
            _ => self.spec.default_visibility(name),
        }
    }

    fn is_test_definition(&self, node: Node<'_>, kind: &EntityKind, name: &str) -> bool {
        match self.spec.name {
            "rust" => {
                let mut sibling = node.prev_sibling();
                while let Some(s) = sibling {
                    match s.kind() {
                        "attribute_item" => {
                            if is_test_attribute(&self.text(s)) {
                                return true;
                            }
                        }
                        "line_comment" | "block_comment" => {}
                        _ => break,
                    }
                    sibling = s.prev_sibling();
                }
                false
            }
            "java" => {
                let mut cursor = node.walk();
                let found = node
                    .children(&mut cursor)
                    .filter(|c| c.kind() == "modifiers")
                    .any(|m| self.text(m).contains("@Test"));
                found
            }
            "python" => {
                name.starts_with("test")
                    || (*kind == EntityKind::Class && name.starts_with("Test"))
            }
            "go" => {
                let prefixed = ["Test", "Benchmark", "Fuzz", "Example"]
                    .iter()
                    .any(|p| name.starts_with(p));
                prefixed && self.path.map_or(true, |p| p.ends_with("_test.go"))
            }
            "typescript" => self
                .path
                .is_some_and(|p| p.contains(".test.") || p.contains(".spec.")),
            _ => false,
        }
    }

    fn generic_names(&self, node: Node<'_>) -> Vec<String> {
        let Some(params) = node.child_by_field_name("type_parameters") else {
            return Vec::new();
        };
        let mut names = Vec::new();
        let mut cursor = params.walk();
        for child in params.named_children(&mut cursor) {
            let name_node = match child.kind() {
                "type_identifier" | "identifier" => Some(child),
                "lifetime" => None,
                _ => child
                    .child_by_field_name("name")
                    .or_else(|| child.child_by_field_name("left"))
                    .or_else(|| {
                        child
                            .named_child(0)
                            .filter(|c| matches!(c.kind(), "type_identifier" | "identifier"))
                    }),
            };
            if let Some(n) = name_node {
                let text = self.text(n);
                if !text.is_empty() {
                    names.push(text);
                }
            }
        }
        names
    }

    fn type_detail(
        &self,
        node: Node<'_>,
        kind: &EntityKind,
        generics: &[String],
    ) -> Option<TypeDetail> {
        let mut detail = TypeDetail {
            generics: generics.to_vec(),
            ..TypeDetail::default()
        };
        if kind.is_callable() {
            let function_node = match node.child_by_field_name("value") {
                Some(v) if self.spec.name == "typescript" => v,
                _ => node,
            };
            if let Some(params) = function_node.child_by_field_name("parameters") {
                let mut cursor = params.walk();
                for param in params.named_children(&mut cursor) {
                    if param.kind().contains("comment") {
                        continue;
                    }
                    detail.parameters.push(self.parameter(param));
                }
            }
            detail.return_type = self
                .spec
                .return_fields
                .iter()
                .find_map(|f| function_node.child_by_field_name(f))
                .map(|r| {
                    self.text(r)
                        .trim()
                        .trim_start_matches("->")
                        .trim_start_matches(':')
                        .trim()
                        .to_string()
                })
                .filter(|r| !r.is_empty());
        }
        if detail.is_empty() {
            None
        } else {
            Some(detail)
        }
    }

    fn parameter(&self, param: Node<'_>) -> Parameter {
        let name_node = param
            .child_by_field_name("pattern")
            .or_else(|| param.child_by_field_name("name"))
            .or_else(|| {
                if param.kind() == "identifier" {
                    Some(param)
                } else {
                    param.named_child(0).filter(|c| c.kind() == "identifier")
                }
            });
        let name = name_node
            .map(|n| self.text(n))
            .unwrap_or_else(|| self.text(param));
        let type_text = param
            .child_by_field_name("type")
            .map(|t| self.text(t).trim().trim_start_matches(':').trim().to_string())
            .filter(|t| !t.is_empty());
        Parameter {
            name: name.trim().to_string(),
            type_text,
        }
    }

    // -- references ---------------------------------------------------------

    fn push_reference(&mut self, kind: EdgeKind, name: String, node: Node<'_>) {
        let Some(idx) = self.current() else {
            return;
        };
        if name.is_empty() || name == "Self" || name == "self" {
            return;
        }
        if kind == EdgeKind::UsesType && self.generics.iter().flatten().any(|g| *g == name) {
            return;
        }
        self.entities[idx].references.push(RawReference {
            kind,
            name,
            line: node.start_position().row as u32 + 1,
        });
    }

    fn record_call(&mut self, node: Node<'_>, field: &str) {
        let Some(callee) = node.child_by_field_name(field) else {
            return;
        };
        let Some(name) = self.callee_name(callee) else {
            return;
        };
        let name = match name.strip_prefix("Self::") {
            Some(rest) => {
                let owner = self
                    .current()
                    .and_then(|idx| self.entities[idx].owner.clone());
                match owner {
                    Some(o) => format!("{o}::{rest}"),
                    None => rest.to_string(),
                }
            }
            None => name,
        };
        self.push_reference(EdgeKind::Calls, name, node);
    }

    fn callee_name(&self, callee: Node<'_>) -> Option<String> {
        let text = match callee.kind() {
            "identifier" | "type_identifier" | "property_identifier" | "field_identifier" => {
                self.text(callee)
            }
            "scoped_identifier" | "scoped_type_identifier" | "nested_type_identifier"
            | "qualified_type" => strip_type_text(&self.text(callee)),
            "field_expression" | "selector_expression" => {
                self.text(callee.child_by_field_name("field")?)
            }
            "member_expression" => self.text(callee.child_by_field_name("property")?),
            "attribute" => self.text(callee.child_by_field_name("attribute")?),
            "generic_function" => return self.callee_name(callee.child_by_field_name("function")?),
            "generic_type" => return self.callee_name(callee.named_child(0)?),
            _ => return None,
        };
        let mut name = text.trim();
        for prefix in ["crate::", "self::", "super::"] {
            while let Some(rest) = name.strip_prefix(prefix) {
                name = rest;
            }
        }
        if is_identifier_like(name) {
            Some(name.to_string())
        } else {
            None
        }
    }

    /// Record a type reference. Returns `false` if the node should be
    /// descended into instead.
    fn record_type_ref(&mut self, node: Node<'_>) -> bool {
        let text = strip_type_text(&self.text(node));
        if !is_identifier_like(&text) {
            return false;
        }
        self.push_reference(EdgeKind::UsesType, text, node);
        true
    }

    fn record_types(&mut self, node: Node<'_>, kind: EdgeKind) {
        let mut names = Vec::new();
        collect_type_names(node, self.src, &mut names, 0);
        for name in names {
            self.push_reference(kind, name, node);
        }
    }

    fn record_import(&mut self, node: Node<'_>) {
        let text = self.text(node);
        let line = node.start_position().row as u32 + 1;
        let owner = self.current();
        for (path, local_name) in split_import(self.spec.name, &text) {
            if owner.is_some() {
                self.push_reference(EdgeKind::DependsOn, path.clone(), node);
            }
            self.imports.push(RawImport {
                path,
                local_name,
                line,
                owner,
            });
        }
    }
}

fn is_exported(node: Node<'_>) -> bool {
    let mut current = node.parent();
    for _ in 0..3 {
        match current {
            Some(p) if p.kind() == "export_statement" => return true,
            Some(p) => current = p.parent(),
            None => return false,
        }
    }
    false
}

fn go_receiver_type(receiver: Node<'_>, src: &[u8]) -> Option<String> {
    let mut cursor = receiver.walk();
    let param = receiver
        .named_children(&mut cursor)
        .find(|c| c.kind() == "parameter_declaration")?;
    let ty = param.child_by_field_name("type")?;
    let text = strip_type_text(&slice_text(src, ty.byte_range()));
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Collect the outermost type names below `node`, skipping type arguments.
fn collect_type_names(node: Node<'_>, src: &[u8], out: &mut Vec<String>, depth: usize) {
    if depth > 16 {
        return;
    }
    if TYPE_NAME_KINDS.contains(&node.kind()) {
        let text = strip_type_text(&slice_text(src, node.byte_range()));
        if is_identifier_like(&text) && !out.contains(&text) {
            out.push(text);
        }
        return;
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
    for child in children {
        if child.kind() == "type_arguments" {
            continue;
        }
        collect_type_names(child, src, out, depth + 1);
    }
}

/// Split an import statement's text into `(path, local_name)` pairs.
pub fn split_import(language: &str, text: &str) -> Vec<(String, String)> {
    let text = text.trim().trim_end_matches(';').trim();
    match language {
        "rust" => {
            let body = text
                .trim_start_matches("pub(crate)")
                .trim_start_matches("pub")
                .trim()
                .trim_start_matches("use")
                .trim();
            expand_rust_use(body)
        }
        "python" => split_python_import(text),
        "java" => {
            let body = text
                .trim_start_matches("import")
                .trim()
                .trim_start_matches("static")
                .trim();
            if body.ends_with(".*") || body.is_empty() {
                return Vec::new();
            }
            vec![(body.to_string(), short_name(body).to_string())]
        }
        "go" => {
            let mut parts = text.split_whitespace();
            let first = parts.next().unwrap_or_default();
            let (alias, path) = match parts.next() {
                Some(path) => (Some(first), path),
                None => (None, first),
            };
            let path = path.trim_matches('"').to_string();
            if path.is_empty() {
                return Vec::new();
            }
            let local = alias
                .map(str::to_string)
                .unwrap_or_else(|| path.rsplit('/').next().unwrap_or_default().to_string());
            vec![(path, local)]
        }
        "typescript" => split_ts_import(text),
        _ => Vec::new(),
    }
}

fn expand_rust_use(body: &str) -> Vec<(String, String)> {
    let body: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(open) = body.find('{') {
        let prefix = body[..open].trim().trim_end_matches("::");
        let inner = body[open + 1..].trim_end_matches('}');
        let mut out = Vec::new();
        for item in split_top_level(inner) {
            let item = item.trim();
            if item.is_empty() || item == "*" {
                continue;
            }
            let joined = if item == "self" {
                prefix.to_string()
            } else if prefix.is_empty() {
                item.to_string()
            } else {
                format!("{prefix}::{item}")
            };
            out.extend(expand_rust_use(&joined));
        }
        return out;
    }
    if body.ends_with('*') || body.is_empty() {
        return Vec::new();
    }
    let (path, local) = match body.split_once(" as ") {
        Some((path, alias)) => (path.trim().to_string(), alias.trim().to_string()),
        None => (body.clone(), short_name(&body).to_string()),
    };
    let path = path
        .trim_start_matches("crate::")
        .trim_start_matches("self::")
        .to_string();
    if local == "_" {
        return Vec::new();
    }
    vec![(path, local)]
}

/// Split on commas that are not nested inside braces.
fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn split_python_import(text: &str) -> Vec<(String, String)> {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let alias_pair = |item: &str, prefix: Option<&str>| -> Option<(String, String)> {
        let item = item.trim().trim_matches(|c| c == '(' || c == ')').trim();
        if item.is_empty() || item == "*" {
            return None;
        }
        let (name, alias) = match item.split_once(" as ") {
            Some((n, a)) => (n.trim(), Some(a.trim())),
            None => (item, None),
        };
        let path = match prefix {
            Some(p) => format!("{p}.{name}"),
            None => name.to_string(),
        };
        let local = alias.unwrap_or_else(|| short_name(name)).to_string();
        Some((path, local))
    };
    if let Some(rest) = text.strip_prefix("from ") {
        let Some((module, names)) = rest.split_once(" import ") else {
            return Vec::new();
        };
        let module = module.trim().trim_start_matches('.');
        names
            .split(',')
            .filter_map(|item| {
                alias_pair(item, if module.is_empty() { None } else { Some(module) })
            })
            .collect()
    } else if let Some(rest) = text.strip_prefix("import ") {
        rest.split(',').filter_map(|item| alias_pair(item, None)).collect()
    } else {
        Vec::new()
    }
}

fn split_ts_import(text: &str) -> Vec<(String, String)> {
    let Some((clause, source)) = text.rsplit_once(" from ") else {
        return Vec::new();
    };
    let module = source.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
    let clause = clause.trim().trim_start_matches("import").trim();
    let clause = clause.strip_prefix("type ").unwrap_or(clause);
    let mut out = Vec::new();
    let (default_part, named_part) = match clause.find('{') {
        Some(open) => (
            clause[..open].trim().trim_end_matches(',').trim(),
            Some(clause[open + 1..].trim_end_matches('}')),
        ),
        None => (clause, None),
    };
    if !default_part.is_empty() && !default_part.starts_with('*') {
        out.push((format!("{module}.default"), default_part.to_string()));
    }
    if let Some(named) = named_part {
        for item in named.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (name, local) = match item.split_once(" as ") {
                Some((n, a)) => (n.trim(), a.trim()),
                None => (item, item),
            };
            out.push((format!("{module}.{name}"), local.to_string()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::languages::{GO, JAVA, PYTHON, RUST, TYPESCRIPT};

    fn parse_rust(src: &str) -> ParsedFile {
        TolerantParser::new(&RUST).parse(src.as_bytes())
    }

    fn names(parsed: &ParsedFile) -> Vec<&str> {
        parsed
            .entities
            .iter()
            .map(|e| e.qualified_name.as_str())
            .collect()
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        let parsed = parse_rust("");
        assert!(parsed.entities.is_empty());
        assert!(parsed.diagnostics.is_empty());
        let parsed = parse_rust("   \n\n");
        assert!(parsed.entities.is_empty());
    }

    #[test]
    fn test_binary_input_yields_diagnostic() {
        let parsed = TolerantParser::new(&RUST).parse(&[0x7f, b'E', b'L', b'F', 0, 0, 1]);
        assert!(parsed.entities.is_empty());
        assert_eq!(parsed.diagnostics.len(), 1);
    }

    #[test]
    fn test_well_formed_functions_are_high_confidence() {
        let parsed = parse_rust("fn foo() { bar(); }\nfn bar() {}\n");
        assert_eq!(names(&parsed), vec!["foo", "bar"]);
        assert!(parsed
            .entities
            .iter()
            .all(|e| e.confidence == Confidence::High));
        let foo = &parsed.entities[0];
        assert_eq!(foo.kind, EntityKind::Function);
        assert_eq!(foo.signature_text.as_deref(), Some("fn foo()"));
        assert_eq!(foo.span.start_line, 1);
        assert_eq!(foo.references.len(), 1);
        assert_eq!(foo.references[0].kind, EdgeKind::Calls);
        assert_eq!(foo.references[0].name, "bar");
    }

    #[test]
    fn test_missing_brace_is_low_confidence() {
        let parsed = parse_rust("fn foo() {\n    bar();\n");
        let foo = parsed
            .entities
            .iter()
            .find(|e| e.name == "foo")
            .expect("foo recovered");
        assert_eq!(foo.confidence, Confidence::Low);
        assert!(!foo.notes.is_empty());
        assert!(!parsed.diagnostics.is_empty());
    }

    #[test]
    fn test_impl_methods_are_scoped_and_owned() {
        let src = "pub struct Foo;\nimpl Foo {\n    pub fn new() -> Self { Foo }\n    fn helper(&self, x: u32) -> u32 { x }\n}\n";
        let parsed = parse_rust(src);
        assert_eq!(
            names(&parsed),
            vec!["Foo", "impl Foo", "Foo::new", "Foo::helper"]
        );
        let new = &parsed.entities[2];
        assert_eq!(new.kind, EntityKind::Method);
        assert_eq!(new.owner.as_deref(), Some("Foo"));
        assert_eq!(new.parent, Some(1));
        assert_eq!(new.visibility, Visibility::Public);
        let helper = &parsed.entities[3];
        assert_eq!(helper.visibility, Visibility::Private);
        let detail = helper.type_detail.as_ref().expect("type detail");
        assert_eq!(detail.parameters.len(), 2);
        assert_eq!(detail.parameters[1].name, "x");
        assert_eq!(detail.parameters[1].type_text.as_deref(), Some("u32"));
        assert_eq!(detail.return_type.as_deref(), Some("u32"));
    }

    #[test]
    fn test_trait_impl_records_implements() {
        let src = "trait Greet { fn hi(&self); }\nstruct P;\nimpl Greet for P { fn hi(&self) {} }\n";
        let parsed = parse_rust(src);
        let imp = parsed
            .entities
            .iter()
            .find(|e| e.kind == EntityKind::ImplBlock)
            .expect("impl block");
        assert_eq!(imp.qualified_name, "impl Greet for P");
        assert!(imp
            .references
            .iter()
            .any(|r| r.kind == EdgeKind::Implements && r.name == "Greet"));
        assert!(!imp
            .references
            .iter()
            .any(|r| r.kind == EdgeKind::UsesType && r.name == "Greet"));
        let sig = parsed
            .entities
            .iter()
            .find(|e| e.qualified_name == "Greet::hi")
            .expect("trait method");
        assert_eq!(sig.kind, EntityKind::Method);
    }

    #[test]
    fn test_generic_parameters_are_not_type_references() {
        let parsed = parse_rust("fn wrap<T: Clone>(value: T, cfg: Config) -> Vec<T> { vec![] }\n");
        let refs: Vec<&str> = parsed.entities[0]
            .references
            .iter()
            .filter(|r| r.kind == EdgeKind::UsesType)
            .map(|r| r.name.as_str())
            .collect();
        assert!(refs.contains(&"Config"));
        assert!(refs.contains(&"Vec"));
        assert!(!refs.contains(&"T"));
        let detail = parsed.entities[0].type_detail.as_ref().unwrap();
        assert_eq!(detail.generics, vec!["T".to_string()]);
    }

    #[test]
    fn test_test_attributes_and_modules() {
        let src = "#[cfg(test)]\nmod tests {\n    #[test]\n    fn it_works() {}\n    fn helper() {}\n}\n";
        let parsed = parse_rust(src);
        assert!(parsed.entities.iter().all(|e| e.is_test));
        assert_eq!(names(&parsed), vec!["tests", "tests::it_works", "tests::helper"]);
    }

    #[test]
    fn test_attributes_mentioning_test_in_strings_are_not_tests() {
        let src = concat!(
            "#[serde(rename = \"latest\")]\npub struct Latest;\n",
            "#[doc = \"attestation\"]\nfn attest() {}\n",
            "#[cfg(feature = \"contest\")]\nfn contest() {}\n",
            "#[cfg(not(test))]\nfn release_only() {}\n",
            "#[tokio::test]\nasync fn runs_async() {}\n",
            "#[cfg(all(test, feature = \"slow\"))]\nfn slow_check() {}\n",
        );
        let parsed = parse_rust(src);
        let tests: Vec<&str> = parsed
            .entities
            .iter()
            .filter(|e| e.is_test)
            .map(|e| e.qualified_name.as_str())
            .collect();
        assert_eq!(tests, vec!["runs_async", "slow_check"]);
    }

    #[test]
    fn test_attribute_path_matching() {
        assert!(is_test_attribute("#[test]"));
        assert!(is_test_attribute("#[ tokio :: test ]"));
        assert!(is_test_attribute("#![cfg(test)]"));
        assert!(!is_test_attribute("#[testing]"));
        assert!(!is_test_attribute("#[cfg(feature = \"test\")]"));
        assert!(!is_test_attribute("#[cfg_attr(test, derive(Debug))]"));
    }

    #[test]
    fn test_rust_use_expansion() {
        let got = split_import("rust", "use crate::store::{database::GraphStore, schema as s};");
        assert_eq!(
            got,
            vec![
                ("store::database::GraphStore".to_string(), "GraphStore".to_string()),
                ("store::schema".to_string(), "s".to_string()),
            ]
        );
        assert!(split_import("rust", "use std::io::*;").is_empty());
    }

    #[test]
    fn test_python_and_ts_imports() {
        assert_eq!(
            split_import("python", "from pkg.mod import a, b as c"),
            vec![
                ("pkg.mod.a".to_string(), "a".to_string()),
                ("pkg.mod.b".to_string(), "c".to_string()),
            ]
        );
        assert_eq!(
            split_import("typescript", "import Def, { x as y } from './util'"),
            vec![
                ("./util.default".to_string(), "Def".to_string()),
                ("./util.x".to_string(), "y".to_string()),
            ]
        );
        assert_eq!(
            split_import("go", "\"net/http\""),
            vec![("net/http".to_string(), "http".to_string())]
        );
    }

    #[test]
    fn test_python_methods_and_calls() {
        let src = "class Service:\n    def run(self):\n        helper()\n\ndef helper():\n    pass\n";
        let parsed = TolerantParser::new(&PYTHON).parse(src.as_bytes());
        assert_eq!(names(&parsed), vec!["Service", "Service.run", "helper"]);
        assert_eq!(parsed.entities[1].kind, EntityKind::Method);
        assert_eq!(parsed.entities[1].references[0].name, "helper");
        assert_eq!(parsed.entities[1].signature_text.as_deref(), Some("def run(self)"));
    }

    #[test]
    fn test_go_methods_use_receiver() {
        let src = "package main\n\ntype Server struct{}\n\nfunc (s *Server) Start() { run() }\n\nfunc run() {}\n";
        let parsed = TolerantParser::new(&GO).parse(src.as_bytes());
        assert_eq!(names(&parsed), vec!["Server", "Server.Start", "run"]);
        assert_eq!(parsed.entities[0].kind, EntityKind::Struct);
        assert_eq!(parsed.entities[1].owner.as_deref(), Some("Server"));
        assert_eq!(parsed.entities[1].visibility, Visibility::Public);
        assert_eq!(parsed.entities[2].visibility, Visibility::Private);
    }

    #[test]
    fn test_java_class_members() {
        let src = "public class Box implements Shape {\n  public int area() { return calc(); }\n  private int calc() { return 1; }\n}\n";
        let parsed = TolerantParser::new(&JAVA).parse(src.as_bytes());
        assert_eq!(names(&parsed), vec!["Box", "Box.area", "Box.calc"]);
        assert!(parsed.entities[0]
            .references
            .iter()
            .any(|r| r.kind == EdgeKind::Implements && r.name == "Shape"));
        assert_eq!(parsed.entities[2].visibility, Visibility::Private);
    }

    #[test]
    fn test_typescript_arrow_functions() {
        let src = "export const add = (a: number, b: number): number => a + b;\nconst x = 5;\n";
        let parsed = TolerantParser::new(&TYPESCRIPT).parse(src.as_bytes());
        assert_eq!(names(&parsed), vec!["add"]);
        assert_eq!(parsed.entities[0].visibility, Visibility::Public);
    }

    #[test]
    fn test_depth_limit_marks_low() {
        let body = "(".repeat(200) + &")".repeat(200);
        let src = format!("fn deep() {{ let x = {body}; }}\n");
        let parsed = TolerantParser::new(&RUST)
            .with_max_depth(16)
            .parse(src.as_bytes());
        let deep = &parsed.entities[0];
        assert_eq!(deep.confidence, Confidence::Low);
        assert!(deep.notes.contains(&ParseRecoveryNote::DepthLimit));
    }

    #[test]
    fn test_invalid_utf8_does_not_panic() {
        let mut src = b"fn ok() {}\nfn bad() { let s = \"".to_vec();
        src.extend_from_slice(&[0xff, 0xfe, b'"', b';', b'}', b'\n']);
        let parsed = parse_rust(std::str::from_utf8(&src[..11]).unwrap());
        assert_eq!(names(&parsed), vec!["ok"]);
        let parsed = TolerantParser::new(&RUST).parse(&src);
        assert!(parsed.entities.iter().any(|e| e.name == "ok"));
    }

    #[test]
    fn test_deterministic_output() {
        let src = "mod a { pub fn x() { y(); } fn y() {} }\nstruct S { f: a::T }\n";
        assert_eq!(parse_rust(src), parse_rust(src));
    }
}
