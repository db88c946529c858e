use serde::{Deserialize, Serialize};

/// Insertion-ordered tag map, the shape of every cache layer and every
/// gateway record. Keys are tag names, values are exiftool's untyped scalars.
pub type TagMap = serde_json::Map<String, serde_json::Value>;

/// Combined edit status of a (possibly virtual) tag:
/// `Some(true)` = confirmed applied, `Some(false)` = confirmed rejected,
/// `None` = indeterminate (write pending or not yet reconciled).
pub type EditStatus = Option<bool>;

/// Supported cast types for `(type)Tag` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Datetime,
}

impl CastKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "datetime" => Some(Self::Datetime),
            _ => None,
        }
    }
}

/// A parsed tag identifier.
///
/// `?Name` is conditional, `&Name` is composite, `(type)Inner` is a cast,
/// anything else addresses a real tag. Produced only by [`TagAddress::parse`]
/// so no caller ever sniffs prefixes itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAddress {
    Normal(String),
    Composite(String),
    Conditional(String),
    Cast { kind: CastKind, inner: String },
}

impl TagAddress {
    pub fn parse(raw: &str) -> Self {
        if let Some(name) = raw.strip_prefix('?') {
            return Self::Conditional(name.to_string());
        }
        if let Some(name) = raw.strip_prefix('&') {
            return Self::Composite(name.to_string());
        }
        if let Some(rest) = raw.strip_prefix('(')
            && let Some((kind_name, inner)) = rest.split_once(')')
            && let Some(kind) = CastKind::from_name(kind_name)
        {
            return Self::Cast {
                kind,
                inner: inner.to_string(),
            };
        }
        // Unrecognized cast kinds fall through to a literal tag name.
        Self::Normal(raw.to_string())
    }
}

/// Definition of a composite (computed) tag.
///
/// `format` is a template of bracketed fields containing `<Tag>`
/// placeholders; `pattern` is the inverse regex with named groups used to
/// split an edited value back into the underlying tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeDef {
    pub format: String,
    pub pattern: String,
}

/// One candidate of a conditional tag: `target` is used when `pattern`
/// matches the placeholder-substituted `condition` template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalCandidate {
    pub target: String,
    pub condition: String,
    pub pattern: String,
}

/// Per-tag datetime conventions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DatetimeTagDef {
    /// The on-disk value is implicitly UTC whether or not an offset is present.
    #[serde(default)]
    pub as_utc: bool,
    /// The tag format can carry a timezone offset. When false, any resolved
    /// offset is stripped before serialization.
    #[serde(default = "default_true")]
    pub is_timezone_explicit: bool,
    /// The tag format can carry fractional seconds.
    #[serde(default = "default_true")]
    pub support_subsec: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DatetimeTagDef {
    fn default() -> Self {
        Self {
            as_utc: false,
            is_timezone_explicit: true,
            support_subsec: true,
        }
    }
}
