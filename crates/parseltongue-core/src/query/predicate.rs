//! Closed predicate language for entity pattern queries.
//!
//! Predicates are built through fallible constructors so an invalid regex is
//! reported as [`QueryError::InvalidPattern`] at construction time, never as
//! an empty result. Text predicates on plain columns are pushed down to SQL;
//! every predicate is also evaluated in memory against the decoded entity.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::errors::QueryError;
use crate::models::{Confidence, Entity, EntityKind, Visibility};
use crate::query::guards::{check_pattern, MAX_REGEX_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    QualifiedName,
    Signature,
    FilePath,
}

impl TextField {
    fn column(&self) -> &'static str {
        match self {
            TextField::QualifiedName => "qualified_name",
            TextField::Signature => "signature_text",
            TextField::FilePath => "file_path",
        }
    }

    fn value<'a>(&self, entity: &'a Entity) -> Option<&'a str> {
        match self {
            TextField::QualifiedName => Some(entity.qualified_name()),
            TextField::Signature => entity.signature_text.as_deref(),
            TextField::FilePath => Some(entity.file_path()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    Exact,
    Contains,
    Regex,
}

#[derive(Clone, Debug)]
pub enum TextMatcher {
    Exact(String),
    Contains(String),
    Regex(Regex),
}

impl TextMatcher {
    pub fn new(op: MatchOp, pattern: &str) -> Result<Self, QueryError> {
        check_pattern(pattern)?;
        Ok(match op {
            MatchOp::Exact => TextMatcher::Exact(pattern.to_string()),
            MatchOp::Contains => TextMatcher::Contains(pattern.to_string()),
            MatchOp::Regex => {
                let regex = RegexBuilder::new(pattern)
                    .size_limit(MAX_REGEX_SIZE)
                    .build()
                    .map_err(|e| QueryError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: e.to_string(),
                    })?;
                TextMatcher::Regex(regex)
            }
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            TextMatcher::Exact(value) => text == value,
            TextMatcher::Contains(value) => text.contains(value.as_str()),
            TextMatcher::Regex(regex) => regex.is_match(text),
        }
    }
}

#[derive(Clone, Debug)]
pub enum QueryPredicate {
    Text { field: TextField, matcher: TextMatcher },
    Kind(EntityKind),
    IsTest(bool),
    Confidence(Confidence),
    Language(String),
    Visibility(Visibility),
}

impl QueryPredicate {
    pub fn text(field: TextField, op: MatchOp, pattern: &str) -> Result<Self, QueryError> {
        Ok(QueryPredicate::Text {
            field,
            matcher: TextMatcher::new(op, pattern)?,
        })
    }

    pub fn name_equals(name: &str) -> Result<Self, QueryError> {
        Self::text(TextField::QualifiedName, MatchOp::Exact, name)
    }

    pub fn name_contains(fragment: &str) -> Result<Self, QueryError> {
        Self::text(TextField::QualifiedName, MatchOp::Contains, fragment)
    }

    pub fn name_matches(pattern: &str) -> Result<Self, QueryError> {
        Self::text(TextField::QualifiedName, MatchOp::Regex, pattern)
    }

    pub fn signature_contains(fragment: &str) -> Result<Self, QueryError> {
        Self::text(TextField::Signature, MatchOp::Contains, fragment)
    }

    pub fn signature_matches(pattern: &str) -> Result<Self, QueryError> {
        Self::text(TextField::Signature, MatchOp::Regex, pattern)
    }

    pub fn in_file(path: &str) -> Result<Self, QueryError> {
        Self::text(TextField::FilePath, MatchOp::Exact, path)
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            QueryPredicate::Text { field, matcher } => field
                .value(entity)
                .is_some_and(|text| matcher.is_match(text)),
            QueryPredicate::Kind(kind) => entity.kind() == kind,
            QueryPredicate::IsTest(flag) => entity.is_test == *flag,
            QueryPredicate::Confidence(c) => entity.confidence == *c,
            QueryPredicate::Language(lang) => entity.language() == lang,
            QueryPredicate::Visibility(v) => entity.visibility == *v,
        }
    }

    /// SQL condition and bound value for predicates that map onto an indexed
    /// column. Regex predicates have no pushdown.
    pub fn sql_condition(&self) -> Option<(String, Box<dyn rusqlite::types::ToSql>)> {
        match self {
            QueryPredicate::Text { field, matcher } => match matcher {
                TextMatcher::Exact(value) => {
                    Some((format!("{} = ?", field.column()), Box::new(value.clone())))
                }
                TextMatcher::Contains(value) => Some((
                    format!("instr({}, ?) > 0", field.column()),
                    Box::new(value.clone()),
                )),
                TextMatcher::Regex(_) => None,
            },
            QueryPredicate::Kind(kind) => {
                Some(("kind = ?".to_string(), Box::new(kind.as_str().to_string())))
            }
            QueryPredicate::IsTest(flag) => Some(("is_test = ?".to_string(), Box::new(*flag))),
            QueryPredicate::Confidence(c) => {
                Some(("confidence = ?".to_string(), Box::new(c.as_str())))
            }
            QueryPredicate::Language(lang) => {
                Some(("language = ?".to_string(), Box::new(lang.clone())))
            }
            QueryPredicate::Visibility(v) => {
                Some(("visibility = ?".to_string(), Box::new(v.as_str())))
            }
        }
    }
}

pub fn matches_all(predicates: &[QueryPredicate], entity: &Entity) -> bool {
    predicates.iter().all(|p| p.matches(entity))
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// Serialisable predicate as received from a query client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum PredicateSpec {
    QualifiedName { op: MatchOp, value: String },
    Signature { op: MatchOp, value: String },
    FilePath { op: MatchOp, value: String },
    Kind { value: String },
    IsTest { value: bool },
    Confidence { value: String },
    Language { value: String },
    Visibility { value: String },
}

impl PredicateSpec {
    pub fn compile(&self) -> Result<QueryPredicate, QueryError> {
        match self {
            PredicateSpec::QualifiedName { op, value } => {
                QueryPredicate::text(TextField::QualifiedName, *op, value)
            }
            PredicateSpec::Signature { op, value } => {
                QueryPredicate::text(TextField::Signature, *op, value)
            }
            PredicateSpec::FilePath { op, value } => {
                QueryPredicate::text(TextField::FilePath, *op, value)
            }
            PredicateSpec::Kind { value } => Ok(QueryPredicate::Kind(EntityKind::parse(value))),
            PredicateSpec::IsTest { value } => Ok(QueryPredicate::IsTest(*value)),
            PredicateSpec::Confidence { value } => Confidence::parse(value)
                .map(QueryPredicate::Confidence)
                .ok_or_else(|| QueryError::InvalidRequest(format!("unknown confidence `{value}`"))),
            PredicateSpec::Language { value } => Ok(QueryPredicate::Language(value.clone())),
            PredicateSpec::Visibility { value } => Visibility::parse(value)
                .map(QueryPredicate::Visibility)
                .ok_or_else(|| QueryError::InvalidRequest(format!("unknown visibility `{value}`"))),
        }
    }
}

pub fn compile_all(specs: &[PredicateSpec]) -> Result<Vec<QueryPredicate>, QueryError> {
    specs.iter().map(PredicateSpec::compile).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKey, Span};

    fn entity(name: &str, signature: Option<&str>) -> Entity {
        Entity {
            key: EntityKey::new("rust", "src/lib.rs", EntityKind::Function, name, None),
            name: name.to_string(),
            span: Span::default(),
            signature_text: signature.map(str::to_string),
            body_hash: String::new(),
            visibility: Visibility::Public,
            is_test: false,
            confidence: Confidence::High,
            type_detail: None,
        }
    }

    #[test]
    fn test_invalid_regex_is_typed_error() {
        let err = QueryPredicate::name_matches("foo(").unwrap_err();
        match err {
            QueryError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "foo("),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_text_matchers() {
        let e = entity("net::connect", Some("pub fn connect(addr: &str) -> Result<Conn>"));
        assert!(QueryPredicate::name_equals("net::connect").unwrap().matches(&e));
        assert!(!QueryPredicate::name_equals("connect").unwrap().matches(&e));
        assert!(QueryPredicate::name_contains("conn").unwrap().matches(&e));
        assert!(QueryPredicate::signature_matches(r"->\s*Result<")
            .unwrap()
            .matches(&e));
    }

    #[test]
    fn test_missing_signature_never_matches() {
        let e = entity("f", None);
        assert!(!QueryPredicate::signature_contains("").unwrap().matches(&e));
    }

    #[test]
    fn test_predicates_combine_with_and() {
        let e = entity("alpha", Some("fn alpha()"));
        let both = vec![
            QueryPredicate::name_contains("alp").unwrap(),
            QueryPredicate::Kind(EntityKind::Function),
        ];
        assert!(matches_all(&both, &e));
        let conflicting = vec![
            QueryPredicate::name_contains("alp").unwrap(),
            QueryPredicate::IsTest(true),
        ];
        assert!(!matches_all(&conflicting, &e));
    }

    #[test]
    fn test_spec_deserializes_and_compiles() {
        let json = r#"[{"field":"qualified_name","op":"regex","value":"^a"},{"field":"kind","value":"struct"}]"#;
        let specs: Vec<PredicateSpec> = serde_json::from_str(json).unwrap();
        let compiled = compile_all(&specs).unwrap();
        assert_eq!(compiled.len(), 2);
        assert!(matches!(compiled[1], QueryPredicate::Kind(EntityKind::Struct)));

        let bad = PredicateSpec::Confidence {
            value: "medium".to_string(),
        };
        assert!(matches!(bad.compile(), Err(QueryError::InvalidRequest(_))));
    }

    #[test]
    fn test_regex_has_no_sql_pushdown() {
        assert!(QueryPredicate::name_matches("x").unwrap().sql_condition().is_none());
        let (sql, _) = QueryPredicate::name_contains("x")
            .unwrap()
            .sql_condition()
            .unwrap();
        assert_eq!(sql, "instr(qualified_name, ?) > 0");
    }
}
