//! Table-driven language registry for the tree-sitter grammars.
//!
//! Each [`LanguageSpec`] names the syntax node kinds the parser treats as
//! definitions, references and imports. Everything language specific that
//! the parser and extractor need lives here.

use std::path::Path;

use crate::models::{EntityKind, Visibility};

/// Node kinds, across all grammars, that name a type in a type position.
pub const TYPE_NAME_KINDS: &[&str] = &[
    "type_identifier",
    "scoped_type_identifier",
    "nested_type_identifier",
    "generic_type",
    "qualified_type",
    "identifier",
    "scoped_identifier",
    "attribute",
    "member_expression",
];

pub struct LanguageSpec {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    /// Joins scope segments into qualified names.
    pub separator: &'static str,
    /// Syntax node kind -> entity kind label.
    pub definitions: &'static [(&'static str, &'static str)],
    /// Call-like node kind -> field holding the callee.
    pub calls: &'static [(&'static str, &'static str)],
    pub type_refs: &'static [&'static str],
    pub imports: &'static [&'static str],
    /// Fields on a definition whose types are implemented or extended.
    pub implements_fields: &'static [&'static str],
    /// Node kinds whose types are implemented or extended.
    pub implements_kinds: &'static [&'static str],
    pub return_fields: &'static [&'static str],
    /// Keyword token -> entity kind label, used to salvage definitions
    /// from error regions.
    pub recovery_keywords: &'static [(&'static str, &'static str)],
    grammar: fn() -> tree_sitter::Language,
}

impl LanguageSpec {
    pub fn grammar(&self) -> tree_sitter::Language {
        (self.grammar)()
    }

    pub fn definition_kind(&self, node_kind: &str) -> Option<EntityKind> {
        self.definitions
            .iter()
            .find(|(k, _)| *k == node_kind)
            .map(|(_, label)| EntityKind::parse(label))
    }

    pub fn callee_field(&self, node_kind: &str) -> Option<&'static str> {
        self.calls
            .iter()
            .find(|(k, _)| *k == node_kind)
            .map(|(_, field)| *field)
    }

    pub fn is_type_ref(&self, node_kind: &str) -> bool {
        self.type_refs.contains(&node_kind)
    }

    pub fn is_import(&self, node_kind: &str) -> bool {
        self.imports.contains(&node_kind)
    }

    pub fn recovery_kind(&self, token: &str) -> Option<EntityKind> {
        self.recovery_keywords
            .iter()
            .find(|(k, _)| *k == token)
            .map(|(_, label)| EntityKind::parse(label))
    }

    /// Default visibility for a definition that carries no explicit modifier.
    pub fn default_visibility(&self, name: &str) -> Visibility {
        match self.name {
            "go" => {
                if name.chars().next().is_some_and(|c| c.is_uppercase()) {
                    Visibility::Public
                } else {
                    Visibility::Private
                }
            }
            "python" => {
                if name.starts_with('_') {
                    Visibility::Private
                } else {
                    Visibility::Public
                }
            }
            "java" => Visibility::Crate,
            "typescript" => Visibility::Public,
            _ => Visibility::Private,
        }
    }
}

fn rust_grammar() -> tree_sitter::Language {
    tree_sitter_rust::LANGUAGE.into()
}

fn go_grammar() -> tree_sitter::Language {
    tree_sitter_go::LANGUAGE.into()
}

fn java_grammar() -> tree_sitter::Language {
    tree_sitter_java::LANGUAGE.into()
}

fn typescript_grammar() -> tree_sitter::Language {
    tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
}

fn tsx_grammar() -> tree_sitter::Language {
    tree_sitter_typescript::LANGUAGE_TSX.into()
}

fn python_grammar() -> tree_sitter::Language {
    tree_sitter_python::LANGUAGE.into()
}

pub static RUST: LanguageSpec = LanguageSpec {
    name: "rust",
    extensions: &["rs"],
    separator: "::",
    definitions: &[
        ("function_item", "function"),
        ("function_signature_item", "function"),
        ("struct_item", "struct"),
        ("union_item", "struct"),
        ("enum_item", "enum"),
        ("trait_item", "trait"),
        ("mod_item", "module"),
        ("impl_item", "impl"),
        ("type_item", "type_alias"),
        ("const_item", "constant"),
        ("static_item", "constant"),
        ("macro_definition", "macro"),
    ],
    calls: &[("call_expression", "function")],
    type_refs: &["type_identifier", "scoped_type_identifier"],
    imports: &["use_declaration"],
    implements_fields: &["trait"],
    implements_kinds: &[],
    return_fields: &["return_type"],
    recovery_keywords: &[
        ("fn", "function"),
        ("struct", "struct"),
        ("enum", "enum"),
        ("trait", "trait"),
        ("mod", "module"),
        ("type", "type_alias"),
    ],
    grammar: rust_grammar,
};

pub static GO: LanguageSpec = LanguageSpec {
    name: "go",
    extensions: &["go"],
    separator: ".",
    definitions: &[
        ("function_declaration", "function"),
        ("method_declaration", "method"),
        ("type_spec", "struct"),
        ("type_alias", "type_alias"),
    ],
    calls: &[("call_expression", "function")],
    type_refs: &["type_identifier", "qualified_type"],
    imports: &["import_spec"],
    implements_fields: &[],
    implements_kinds: &[],
    return_fields: &["result"],
    recovery_keywords: &[("func", "function"), ("type", "struct")],
    grammar: go_grammar,
};

pub static JAVA: LanguageSpec = LanguageSpec {
    name: "java",
    extensions: &["java"],
    separator: ".",
    definitions: &[
        ("class_declaration", "class"),
        ("record_declaration", "class"),
        ("interface_declaration", "interface"),
        ("enum_declaration", "enum"),
        ("method_declaration", "method"),
        ("constructor_declaration", "method"),
    ],
    calls: &[
        ("method_invocation", "name"),
        ("object_creation_expression", "type"),
    ],
    type_refs: &["type_identifier", "scoped_type_identifier"],
    imports: &["import_declaration"],
    implements_fields: &[],
    implements_kinds: &["superclass", "super_interfaces", "extends_interfaces"],
    return_fields: &["type"],
    recovery_keywords: &[
        ("class", "class"),
        ("interface", "interface"),
        ("enum", "enum"),
    ],
    grammar: java_grammar,
};

pub static TYPESCRIPT: LanguageSpec = LanguageSpec {
    name: "typescript",
    extensions: &["ts"],
    separator: ".",
    definitions: TS_DEFINITIONS,
    calls: TS_CALLS,
    type_refs: &["type_identifier", "nested_type_identifier"],
    imports: &["import_statement"],
    implements_fields: &[],
    implements_kinds: &["implements_clause", "extends_clause", "extends_type_clause"],
    return_fields: &["return_type"],
    recovery_keywords: TS_RECOVERY,
    grammar: typescript_grammar,
};

pub static TSX: LanguageSpec = LanguageSpec {
    name: "typescript",
    extensions: &["tsx"],
    separator: ".",
    definitions: TS_DEFINITIONS,
    calls: TS_CALLS,
    type_refs: &["type_identifier", "nested_type_identifier"],
    imports: &["import_statement"],
    implements_fields: &[],
    implements_kinds: &["implements_clause", "extends_clause", "extends_type_clause"],
    return_fields: &["return_type"],
    recovery_keywords: TS_RECOVERY,
    grammar: tsx_grammar,
};

const TS_DEFINITIONS: &[(&str, &str)] = &[
    ("function_declaration", "function"),
    ("generator_function_declaration", "function"),
    ("class_declaration", "class"),
    ("abstract_class_declaration", "class"),
    ("interface_declaration", "interface"),
    ("enum_declaration", "enum"),
    ("type_alias_declaration", "type_alias"),
    ("method_definition", "method"),
    ("method_signature", "method"),
    ("abstract_method_signature", "method"),
    ("internal_module", "module"),
    ("variable_declarator", "function"),
];

const TS_CALLS: &[(&str, &str)] = &[
    ("call_expression", "function"),
    ("new_expression", "constructor"),
];

const TS_RECOVERY: &[(&str, &str)] = &[
    ("function", "function"),
    ("class", "class"),
    ("interface", "interface"),
    ("enum", "enum"),
];

pub static PYTHON: LanguageSpec = LanguageSpec {
    name: "python",
    extensions: &["py"],
    separator: ".",
    definitions: &[
        ("function_definition", "function"),
        ("class_definition", "class"),
    ],
    calls: &[("call", "function")],
    type_refs: &["type"],
    imports: &["import_statement", "import_from_statement"],
    implements_fields: &["superclasses"],
    implements_kinds: &[],
    return_fields: &["return_type"],
    recovery_keywords: &[("def", "function"), ("class", "class")],
    grammar: python_grammar,
};

pub static LANGUAGES: &[&LanguageSpec] = &[&RUST, &GO, &JAVA, &TYPESCRIPT, &TSX, &PYTHON];

/// Look up a language by its registry name.
pub fn language_by_name(name: &str) -> Option<&'static LanguageSpec> {
    LANGUAGES.iter().copied().find(|spec| spec.name == name)
}

/// Map a path to its language spec by file extension.
pub fn detect_language(path: &str) -> Option<&'static LanguageSpec> {
    let ext = Path::new(path).extension()?.to_string_lossy().to_lowercase();
    LANGUAGES
        .iter()
        .copied()
        .find(|spec| spec.extensions.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_language_by_extension() {
        assert_eq!(detect_language("src/lib.rs").map(|s| s.name), Some("rust"));
        assert_eq!(detect_language("main.go").map(|s| s.name), Some("go"));
        assert_eq!(detect_language("A.java").map(|s| s.name), Some("java"));
        assert_eq!(detect_language("a/b.ts").map(|s| s.name), Some("typescript"));
        assert_eq!(detect_language("a/b.TSX").map(|s| s.name), Some("typescript"));
        assert_eq!(detect_language("x.py").map(|s| s.name), Some("python"));
        assert!(detect_language("README.md").is_none());
        assert!(detect_language("Makefile").is_none());
    }

    #[test]
    fn test_grammars_load() {
        for spec in LANGUAGES {
            let mut parser = tree_sitter::Parser::new();
            assert!(parser.set_language(&spec.grammar()).is_ok(), "{}", spec.name);
        }
    }

    #[test]
    fn test_definition_lookup() {
        assert_eq!(RUST.definition_kind("impl_item"), Some(EntityKind::ImplBlock));
        assert_eq!(
            RUST.definition_kind("macro_definition"),
            Some(EntityKind::Other("macro".to_string()))
        );
        assert_eq!(RUST.definition_kind("block"), None);
        assert_eq!(PYTHON.callee_field("call"), Some("function"));
    }

    #[test]
    fn test_default_visibility() {
        assert_eq!(GO.default_visibility("Handler"), Visibility::Public);
        assert_eq!(GO.default_visibility("handler"), Visibility::Private);
        assert_eq!(PYTHON.default_visibility("_helper"), Visibility::Private);
        assert_eq!(RUST.default_visibility("foo"), Visibility::Private);
    }
}
