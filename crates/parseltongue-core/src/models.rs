//! Shared typed models used across indexing, storage, and query layers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::errors::QueryError;

/// Separator between the components of a canonical entity key.
pub const KEY_SEPARATOR: char = '|';

/// Marker preceding the collision disambiguator in a canonical key.
pub const DISAMBIGUATOR_MARKER: char = '#';

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// EntityKind
// ---------------------------------------------------------------------------

/// Open set of indexable constructs.
///
/// `Unresolved` is reserved for placeholder keys that stand in for edge
/// targets the resolution pass could not bind; no stored entity carries it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Function,
    Method,
    Struct,
    Enum,
    Trait,
    Module,
    ImplBlock,
    Class,
    Interface,
    TypeAlias,
    Constant,
    Unresolved,
    Other(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Function => "function",
            EntityKind::Method => "method",
            EntityKind::Struct => "struct",
            EntityKind::Enum => "enum",
            EntityKind::Trait => "trait",
            EntityKind::Module => "module",
            EntityKind::ImplBlock => "impl",
            EntityKind::Class => "class",
            EntityKind::Interface => "interface",
            EntityKind::TypeAlias => "type_alias",
            EntityKind::Constant => "constant",
            EntityKind::Unresolved => "unresolved",
            EntityKind::Other(name) => name,
        }
    }

    /// Parse a kind label. Unknown labels become `Other`.
    pub fn parse(label: &str) -> Self {
        match label {
            "function" => EntityKind::Function,
            "method" => EntityKind::Method,
            "struct" => EntityKind::Struct,
            "enum" => EntityKind::Enum,
            "trait" => EntityKind::Trait,
            "module" => EntityKind::Module,
            "impl" => EntityKind::ImplBlock,
            "class" => EntityKind::Class,
            "interface" => EntityKind::Interface,
            "type_alias" => EntityKind::TypeAlias,
            "constant" => EntityKind::Constant,
            "unresolved" => EntityKind::Unresolved,
            other => EntityKind::Other(other.to_string()),
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, EntityKind::Function | EntityKind::Method)
    }

    /// Kinds that can be named in a type position.
    pub fn is_type_like(&self) -> bool {
        matches!(
            self,
            EntityKind::Struct
                | EntityKind::Enum
                | EntityKind::Trait
                | EntityKind::Class
                | EntityKind::Interface
                | EntityKind::TypeAlias
        )
    }

    /// Kinds whose members are methods rather than free functions.
    pub fn holds_methods(&self) -> bool {
        matches!(
            self,
            EntityKind::ImplBlock | EntityKind::Trait | EntityKind::Class | EntityKind::Interface
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EntityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(EntityKind::parse(&label))
    }
}

// ---------------------------------------------------------------------------
// EntityKey
// ---------------------------------------------------------------------------

/// Stable identity of an entity.
///
/// Ordering compares `(language, file_path, kind, qualified_name,
/// disambiguator)` component-wise; traversal tie-breaks and every sorted
/// output use this order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub language: String,
    pub file_path: String,
    pub kind: EntityKind,
    pub qualified_name: String,
    pub disambiguator: Option<u32>,
}

impl EntityKey {
    pub fn new(
        language: impl Into<String>,
        file_path: impl Into<String>,
        kind: EntityKind,
        qualified_name: impl Into<String>,
        disambiguator: Option<u32>,
    ) -> Self {
        Self {
            language: language.into(),
            file_path: file_path.into(),
            kind,
            qualified_name: qualified_name.into(),
            disambiguator,
        }
    }

    /// Placeholder target for an edge whose target could not be bound.
    pub fn unresolved(language: impl Into<String>, target_name: impl Into<String>) -> Self {
        Self::new(
            language,
            String::new(),
            EntityKind::Unresolved,
            target_name,
            None,
        )
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == EntityKind::Unresolved
    }

    /// Canonical text form, also the primary key in storage.
    pub fn canonical(&self) -> String {
        let mut out = format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.language,
            self.file_path,
            self.kind.as_str(),
            self.qualified_name,
            sep = KEY_SEPARATOR
        );
        if let Some(n) = self.disambiguator {
            out.push(DISAMBIGUATOR_MARKER);
            out.push_str(&n.to_string());
        }
        out
    }

    /// Last segment of the qualified name.
    pub fn short_name(&self) -> &str {
        short_name(&self.qualified_name)
    }

    fn sort_tuple(&self) -> (&str, &str, &str, &str, Option<u32>) {
        (
            &self.language,
            &self.file_path,
            self.kind.as_str(),
            &self.qualified_name,
            self.disambiguator,
        )
    }
}

/// Last `::`/`.` separated segment of a qualified name.
pub fn short_name(qualified_name: &str) -> &str {
    let after_colons = qualified_name
        .rsplit_once("::")
        .map(|(_, tail)| tail)
        .unwrap_or(qualified_name);
    after_colons
        .rsplit_once('.')
        .map(|(_, tail)| tail)
        .unwrap_or(after_colons)
}

impl Ord for EntityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_tuple().cmp(&other.sort_tuple())
    }
}

impl PartialOrd for EntityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for EntityKey {
    type Err = QueryError;

    /// Parse `language|file_path|kind|qualified_name[#n]`.
    ///
    /// The file path may itself contain the separator; language is taken
    /// from the front, kind and qualified name from the back.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QueryError::InvalidRequest(format!("malformed entity key `{s}`"));
        let (language, rest) = s.split_once(KEY_SEPARATOR).ok_or_else(invalid)?;
        let (rest, qualified) = rest.rsplit_once(KEY_SEPARATOR).ok_or_else(invalid)?;
        let (file_path, kind) = rest.rsplit_once(KEY_SEPARATOR).ok_or_else(invalid)?;
        if language.is_empty() || kind.is_empty() || qualified.is_empty() {
            return Err(invalid());
        }
        let (qualified_name, disambiguator) = match qualified.rsplit_once(DISAMBIGUATOR_MARKER) {
            Some((name, suffix))
                if !name.is_empty()
                    && !suffix.is_empty()
                    && suffix.bytes().all(|b| b.is_ascii_digit()) =>
            {
                (name, Some(suffix.parse::<u32>().map_err(|_| invalid())?))
            }
            _ => (qualified, None),
        };
        Ok(EntityKey::new(
            language,
            file_path,
            EntityKind::parse(kind),
            qualified_name,
            disambiguator,
        ))
    }
}

impl Serialize for EntityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Entity attributes
// ---------------------------------------------------------------------------

/// Source location. Lines are 1-based, columns are 0-based byte offsets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl Span {
    pub fn contains_line(&self, line: u32) -> bool {
        self.start_line <= line && line <= self.end_line
    }

    pub fn line_count(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line) + 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Crate,
    Restricted,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Crate => "crate",
            Visibility::Restricted => "restricted",
            Visibility::Private => "private",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "public" => Some(Visibility::Public),
            "crate" => Some(Visibility::Crate),
            "restricted" => Some(Visibility::Restricted),
            "private" => Some(Visibility::Private),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Low => "low",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "high" => Some(Confidence::High),
            "low" => Some(Confidence::Low),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub type_text: Option<String>,
}

/// Extended type information, exported at disclosure level 2.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDetail {
    pub parameters: Vec<Parameter>,
    pub return_type: Option<String>,
    pub generics: Vec<String>,
}

impl TypeDetail {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.return_type.is_none() && self.generics.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// One indexable construct.
///
/// Kind, qualified name, language and file path live in the key; the
/// accessors below read them from there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub name: String,
    pub span: Span,
    pub signature_text: Option<String>,
    pub body_hash: String,
    pub visibility: Visibility,
    pub is_test: bool,
    pub confidence: Confidence,
    #[serde(default)]
    pub type_detail: Option<TypeDetail>,
}

impl Entity {
    pub fn kind(&self) -> &EntityKind {
        &self.key.kind
    }

    pub fn qualified_name(&self) -> &str {
        &self.key.qualified_name
    }

    pub fn file_path(&self) -> &str {
        &self.key.file_path
    }

    pub fn language(&self) -> &str {
        &self.key.language
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Calls,
    Implements,
    UsesType,
    DependsOn,
    ContainedIn,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 5] = [
        EdgeKind::Calls,
        EdgeKind::Implements,
        EdgeKind::UsesType,
        EdgeKind::DependsOn,
        EdgeKind::ContainedIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Calls => "calls",
            EdgeKind::Implements => "implements",
            EdgeKind::UsesType => "uses_type",
            EdgeKind::DependsOn => "depends_on",
            EdgeKind::ContainedIn => "contained_in",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        EdgeKind::ALL.into_iter().find(|k| k.as_str() == label)
    }

    /// Whether an entity of `kind` is a plausible target of this edge kind.
    pub fn accepts_target(&self, kind: &EntityKind) -> bool {
        match self {
            EdgeKind::Calls => kind.is_callable() || *kind == EntityKind::Class,
            EdgeKind::Implements => matches!(
                kind,
                EntityKind::Trait | EntityKind::Interface | EntityKind::Class
            ),
            EdgeKind::UsesType => kind.is_type_like(),
            EdgeKind::DependsOn => {
                !matches!(kind, EntityKind::ImplBlock | EntityKind::Unresolved)
            }
            EdgeKind::ContainedIn => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Resolved,
    Unresolved { target_name: String },
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved)
    }
}

/// How an edge target was established. `Hydrated` outranks `Syntactic`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Syntactic,
    Hydrated,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Syntactic => "syntactic",
            Provenance::Hydrated => "hydrated",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "syntactic" => Some(Provenance::Syntactic),
            "hydrated" => Some(Provenance::Hydrated),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: EntityKey,
    pub to: EntityKey,
    pub kind: EdgeKind,
    pub resolution: Resolution,
    pub provenance: Provenance,
}

impl Edge {
    pub fn resolved(from: EntityKey, to: EntityKey, kind: EdgeKind, provenance: Provenance) -> Self {
        Self {
            from,
            to,
            kind,
            resolution: Resolution::Resolved,
            provenance,
        }
    }

    pub fn unresolved(from: EntityKey, kind: EdgeKind, target_name: impl Into<String>) -> Self {
        let target_name = target_name.into();
        let to = EntityKey::unresolved(from.language.clone(), target_name.clone());
        Self {
            from,
            to,
            kind,
            resolution: Resolution::Unresolved { target_name },
            provenance: Provenance::Syntactic,
        }
    }

    /// Identity of the edge in the store.
    pub fn triple(&self) -> (&EntityKey, &EntityKey, EdgeKind) {
        (&self.from, &self.to, self.kind)
    }

    pub fn unresolved_name(&self) -> Option<&str> {
        match &self.resolution {
            Resolution::Resolved => None,
            Resolution::Unresolved { target_name } => Some(target_name),
        }
    }
}

impl Ord for Edge {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.from, self.kind, &self.to)
            .cmp(&(&other.from, other.kind, &other.to))
            .then_with(|| self.provenance.cmp(&other.provenance))
            .then_with(|| self.unresolved_name().cmp(&other.unresolved_name()))
    }
}

impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Snapshots, change events, subgraphs
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub file_hashes: BTreeMap<String, String>,
    pub entity_count: u64,
    pub edge_count: u64,
    pub last_updated: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

/// A change notification for one repository-relative path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: String,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn created(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileEventKind::Created,
        }
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileEventKind::Modified,
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileEventKind::Deleted,
        }
    }
}

/// Result of a capped traversal: sorted nodes plus the resolved edges
/// between them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<EntityKey>,
    pub edges: Vec<Edge>,
    /// Keys admitted at each hop, in admission order. Index 0 holds the seeds.
    pub hops: Vec<Vec<EntityKey>>,
    /// Set when the total node budget stopped admissions the per-hop cap
    /// alone would have allowed.
    #[serde(default)]
    pub truncated: bool,
}

impl Subgraph {
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.nodes.binary_search(key).is_ok()
    }
}
