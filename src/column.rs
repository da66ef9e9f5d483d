//! Column selection predicates.
//!
//! A retrieval call names columns as `family:qualifier` specs. Each spec
//! compiles to one of three matcher kinds:
//! - family-only (`cf:`): any column in the family, by prefix
//! - regex: the qualifier contains pattern characters, so the whole spec is
//!   compiled as a regular expression over the full column name
//! - simple: literal byte equality

use bytes::Bytes;
use regex::bytes::Regex;
use rustc_hash::FxHashMap;

use crate::store_key;

/// Qualifier bytes that classify a spec as a regex rather than a literal.
///
/// This set is a compatibility heuristic, not an exhaustive list of regex
/// metacharacters; keep it as-is.
const REGEX_MARKERS: &[u8] = br"\+|^&*$[]{})(";

#[derive(Debug, thiserror::Error)]
pub enum ColumnSpecError {
    #[error("column spec {spec:?} has no family separator")]
    MissingFamilySeparator { spec: String },

    #[error("column spec is not valid UTF-8: {spec:?}")]
    NotUtf8 { spec: String },

    #[error("column spec does not compile as a pattern: {0}")]
    BadPattern(#[from] regex::Error),
}

#[derive(Debug)]
enum ColumnMatcher {
    /// Empty qualifier: match any column of the family. `family` keeps the
    /// trailing separator so a prefix compare cannot match `cfx:` for `cf:`.
    FamilyOnly { family: Bytes },
    /// Full-column pattern, anchored to match the entire column name.
    Pattern { regex: Regex },
    Literal { column: Bytes },
}

impl ColumnMatcher {
    fn compile(spec: &[u8]) -> Result<Self, ColumnSpecError> {
        let display = || String::from_utf8_lossy(spec).into_owned();
        let separator = spec
            .iter()
            .position(|&b| b == store_key::FAMILY_SEPARATOR)
            .ok_or_else(|| ColumnSpecError::MissingFamilySeparator { spec: display() })?;
        let qualifier = &spec[separator + 1..];

        if qualifier.is_empty() {
            return Ok(Self::FamilyOnly {
                family: Bytes::copy_from_slice(&spec[..=separator]),
            });
        }

        if qualifier.iter().any(|b| REGEX_MARKERS.contains(b)) {
            let pattern = std::str::from_utf8(spec)
                .map_err(|_| ColumnSpecError::NotUtf8 { spec: display() })?;
            let regex = Regex::new(&format!("^(?:{pattern})$"))?;
            return Ok(Self::Pattern { regex });
        }

        Ok(Self::Literal {
            column: Bytes::copy_from_slice(spec),
        })
    }

    fn matches(&self, column: &[u8]) -> bool {
        match self {
            Self::FamilyOnly { family } => column.starts_with(family),
            Self::Pattern { regex } => regex.is_match(column),
            Self::Literal { column: literal } => column == literal.as_ref(),
        }
    }

    fn is_wildcard(&self) -> bool {
        matches!(self, Self::FamilyOnly { .. } | Self::Pattern { .. })
    }
}

/// Compiled predicate over column names for one retrieval call.
///
/// Matchers are grouped by family; a column matches when any matcher
/// registered for its family matches. Columns of unregistered families never
/// match.
#[derive(Debug, Default)]
pub struct MatcherSet {
    by_family: FxHashMap<Bytes, Vec<ColumnMatcher>>,
    wildcard: bool,
    multiple_matchers: bool,
}

impl MatcherSet {
    pub fn compile<S: AsRef<[u8]>>(specs: &[S]) -> Result<Self, ColumnSpecError> {
        let mut set = Self::default();
        for spec in specs {
            let spec = spec.as_ref();
            let matcher = ColumnMatcher::compile(spec)?;
            if matcher.is_wildcard() {
                set.wildcard = true;
            }
            // compile() guarantees a separator is present
            let family = store_key::family(spec).unwrap_or(spec);
            let matchers = set
                .by_family
                .entry(Bytes::copy_from_slice(family))
                .or_default();
            matchers.push(matcher);
            if matchers.len() > 1 {
                set.multiple_matchers = true;
            }
        }
        Ok(set)
    }

    pub fn matches(&self, column: &[u8]) -> bool {
        let Some(family) = store_key::family(column) else {
            return false;
        };
        let Some(matchers) = self.by_family.get(family) else {
            return false;
        };
        matchers.iter().any(|m| m.matches(column))
    }

    /// True when any matcher is family-only or a pattern; such scans must
    /// surface every matching column, not just the newest timestamp per row.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// True when some family has more than one matcher registered.
    pub fn has_multiple_matchers(&self) -> bool {
        self.multiple_matchers
    }
}
