//! Semantic versioning parser and range matching
//!
//! Provides semver parsing, range satisfaction, and selection of the highest
//! version satisfying a set of ranges imposed by several requirers.

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Errors that can occur during semver parsing
#[derive(Debug, Error)]
pub enum SemverError {
    /// Invalid version format
    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    /// Invalid constraint format
    #[error("Invalid constraint format: {0}")]
    InvalidConstraint(String),
}

/// Semantic version (MAJOR.MINOR.PATCH)
///
/// Equality and ordering ignore build metadata.
#[derive(Debug, Clone)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

/// Single version comparator
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Exact version (=1.2.3 or 1.2.3)
    Exact(Version),

    /// Caret range (^1.2.3 → >=1.2.3 <2.0.0)
    Caret(Version),

    /// Tilde range (~1.2.3 → >=1.2.3 <1.3.0)
    Tilde(Version),

    /// Greater than (>1.2.3)
    GreaterThan(Version),

    /// Greater than or equal (>=1.2.3)
    GreaterThanOrEqual(Version),

    /// Less than (<1.2.3)
    LessThan(Version),

    /// Less than or equal (<=1.2.3)
    LessThanOrEqual(Version),

    /// Wildcard (1.2.*, 1.x, 1)
    Wildcard(u64, Option<u64>),

    /// Any version (*)
    Any,
}

/// Version range: alternatives separated by `||`, each a set of comparators
/// that must all hold (`>=1.2.0 <2.0.0`).
///
/// The original text is kept so error messages can quote the range exactly
/// as the requirer wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    raw: String,
    alternatives: Vec<Vec<Constraint>>,
}

/// A version with possibly missing components, as written inside a range
#[derive(Debug, Default)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
    prerelease: Option<String>,
}

impl Version {
    /// Parse a version string
    pub fn parse(s: &str) -> Result<Self, SemverError> {
        let s = s.trim();

        // Remove 'v' prefix if present
        let s = s.strip_prefix('v').unwrap_or(s);

        // Split by + to separate build metadata
        let (version_part, build) = match s.split_once('+') {
            Some((v, b)) => (v, Some(b.to_string())),
            None => (s, None),
        };

        // Split by - to separate prerelease
        let (core_version, prerelease) = match version_part.split_once('-') {
            Some((v, p)) => (v, Some(p.to_string())),
            None => (version_part, None),
        };

        if matches!(prerelease.as_deref(), Some("")) {
            return Err(SemverError::InvalidVersion(format!(
                "Empty pre-release tag in '{}'",
                s
            )));
        }

        // Parse MAJOR.MINOR.PATCH
        let parts: Vec<&str> = core_version.split('.').collect();
        if parts.len() != 3 {
            return Err(SemverError::InvalidVersion(format!(
                "Expected MAJOR.MINOR.PATCH, got '{}'",
                s
            )));
        }

        let major = parts[0]
            .parse()
            .map_err(|_| SemverError::InvalidVersion(format!("Invalid major version: {}", parts[0])))?;

        let minor = parts[1]
            .parse()
            .map_err(|_| SemverError::InvalidVersion(format!("Invalid minor version: {}", parts[1])))?;

        let patch = parts[2]
            .parse()
            .map_err(|_| SemverError::InvalidVersion(format!("Invalid patch version: {}", parts[2])))?;

        Ok(Version {
            major,
            minor,
            patch,
            prerelease,
            build,
        })
    }

    /// Create a new version
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Version {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Check if this is a prerelease version
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    fn same_core(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor && self.patch == other.patch
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // Compare major, minor, patch
        match self.major.cmp(&other.major) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match self.minor.cmp(&other.minor) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match self.patch.cmp(&other.patch) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Versions with prerelease are less than without
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => compare_prerelease(a, b),
        }
    }
}

/// Compare dot-separated prerelease identifiers; numeric identifiers sort
/// numerically and below alphanumeric ones.
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(n), Ok(m)) => n.cmp(&m),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl Partial {
    fn parse(s: &str) -> Result<Self, SemverError> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let s = match s.split_once('+') {
            Some((v, _)) => v,
            None => s,
        };
        let (core, prerelease) = match s.split_once('-') {
            Some((v, p)) => (v, Some(p.to_string())),
            None => (s, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(SemverError::InvalidConstraint(format!("Invalid version: {}", s)));
        }

        let mut components = [None; 3];
        let mut wildcard_seen = false;
        for (i, part) in parts.iter().enumerate() {
            if matches!(*part, "*" | "x" | "X") {
                wildcard_seen = true;
                continue;
            }
            if wildcard_seen {
                return Err(SemverError::InvalidConstraint(format!(
                    "Invalid wildcard: {}",
                    s
                )));
            }
            components[i] = Some(part.parse::<u64>().map_err(|_| {
                SemverError::InvalidConstraint(format!("Invalid version component: {}", part))
            })?);
        }

        Ok(Partial {
            major: components[0],
            minor: components[1],
            patch: components[2],
            prerelease,
        })
    }

    fn is_complete(&self) -> bool {
        self.major.is_some() && self.minor.is_some() && self.patch.is_some()
    }

    /// Fill missing components with zero
    fn floor(&self) -> Version {
        Version {
            major: self.major.unwrap_or(0),
            minor: self.minor.unwrap_or(0),
            patch: self.patch.unwrap_or(0),
            prerelease: self.prerelease.clone(),
            build: None,
        }
    }

    /// First version above everything this partial covers (`1.2` → `1.3.0`)
    fn ceiling(&self, raw: &str) -> Result<Option<Version>, SemverError> {
        let overflow = || SemverError::InvalidConstraint(format!("Version component too large: {}", raw));
        Ok(match (self.major, self.minor) {
            (Some(major), None) => Some(Version::new(major.checked_add(1).ok_or_else(overflow)?, 0, 0)),
            (Some(major), Some(minor)) => {
                Some(Version::new(major, minor.checked_add(1).ok_or_else(overflow)?, 0))
            }
            (None, _) => None,
        })
    }
}

impl Constraint {
    /// Parse a single comparator (`>=1.2.3`, `^1.2`, `1.x`, `*`)
    pub fn parse(s: &str) -> Result<Self, SemverError> {
        let s = s.trim();

        if s.is_empty() || matches!(s, "*" | "x" | "X") {
            return Ok(Constraint::Any);
        }

        // Longer operators first
        for op in [">=", "<=", ">", "<", "^", "~", "="] {
            if let Some(rest) = s.strip_prefix(op) {
                let rest = rest.trim();
                // "~>" is accepted as a synonym for tilde
                let rest = if op == "~" {
                    rest.strip_prefix('>').unwrap_or(rest).trim()
                } else {
                    rest
                };
                return Self::with_operator(op, Partial::parse(rest)?, s);
            }
        }

        Self::with_operator("=", Partial::parse(s)?, s)
    }

    fn with_operator(op: &str, partial: Partial, raw: &str) -> Result<Self, SemverError> {
        let Some(major) = partial.major else {
            // "*", ">=*", "^x"... match everything; "<*" matches nothing
            return match op {
                "<" => Err(SemverError::InvalidConstraint(format!(
                    "Range matches no version: {}",
                    raw
                ))),
                _ => Ok(Constraint::Any),
            };
        };

        if partial.is_complete() {
            let version = partial.floor();
            return Ok(match op {
                ">=" => Constraint::GreaterThanOrEqual(version),
                "<=" => Constraint::LessThanOrEqual(version),
                ">" => Constraint::GreaterThan(version),
                "<" => Constraint::LessThan(version),
                "^" => Constraint::Caret(version),
                "~" => Constraint::Tilde(version),
                _ => Constraint::Exact(version),
            });
        }

        // Partial versions: 1.2 and 1 stand for every version below them
        let constraint = match op {
            ">=" => Constraint::GreaterThanOrEqual(partial.floor()),
            "<" => Constraint::LessThan(partial.floor()),
            ">" | "<=" => {
                let ceiling = partial.ceiling(raw)?.ok_or_else(|| {
                    SemverError::InvalidConstraint(format!("Invalid range: {}", raw))
                })?;
                if op == ">" {
                    Constraint::GreaterThanOrEqual(ceiling)
                } else {
                    Constraint::LessThan(ceiling)
                }
            }
            "^" => match partial.minor {
                None => Constraint::Wildcard(major, None),
                Some(0) if major == 0 => Constraint::Wildcard(0, Some(0)),
                Some(_) => Constraint::Caret(partial.floor()),
            },
            "~" => match partial.minor {
                None => Constraint::Wildcard(major, None),
                Some(_) => Constraint::Tilde(partial.floor()),
            },
            _ => Constraint::Wildcard(major, partial.minor),
        };
        Ok(constraint)
    }

    /// Check if a version satisfies this constraint
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Constraint::Any => true,

            Constraint::Exact(v) => version.same_core(v) && version.prerelease == v.prerelease,

            Constraint::Caret(v) => {
                // ^1.2.3 := >=1.2.3 <2.0.0
                // ^0.2.3 := >=0.2.3 <0.3.0
                // ^0.0.3 := >=0.0.3 <0.0.4
                if v.major > 0 {
                    version >= v && version.major == v.major
                } else if v.minor > 0 {
                    version >= v && version.major == 0 && version.minor == v.minor
                } else {
                    version >= v
                        && version.major == 0
                        && version.minor == 0
                        && version.patch == v.patch
                }
            }

            Constraint::Tilde(v) => {
                // ~1.2.3 := >=1.2.3 <1.3.0
                version >= v && version.major == v.major && version.minor == v.minor
            }

            Constraint::GreaterThan(v) => version > v,
            Constraint::GreaterThanOrEqual(v) => version >= v,
            Constraint::LessThan(v) => version < v,
            Constraint::LessThanOrEqual(v) => version <= v,

            Constraint::Wildcard(major, minor) => {
                if let Some(m) = minor {
                    version.major == *major && version.minor == *m
                } else {
                    version.major == *major
                }
            }
        }
    }

    /// The version this comparator is anchored on, if any
    fn anchor(&self) -> Option<&Version> {
        match self {
            Constraint::Exact(v)
            | Constraint::Caret(v)
            | Constraint::Tilde(v)
            | Constraint::GreaterThan(v)
            | Constraint::GreaterThanOrEqual(v)
            | Constraint::LessThan(v)
            | Constraint::LessThanOrEqual(v) => Some(v),
            Constraint::Wildcard(..) | Constraint::Any => None,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Any => write!(f, "*"),
            Constraint::Exact(v) => write!(f, "{}", v),
            Constraint::Caret(v) => write!(f, "^{}", v),
            Constraint::Tilde(v) => write!(f, "~{}", v),
            Constraint::GreaterThan(v) => write!(f, ">{}", v),
            Constraint::GreaterThanOrEqual(v) => write!(f, ">={}", v),
            Constraint::LessThan(v) => write!(f, "<{}", v),
            Constraint::LessThanOrEqual(v) => write!(f, "<={}", v),
            Constraint::Wildcard(major, Some(minor)) => write!(f, "{}.{}.*", major, minor),
            Constraint::Wildcard(major, None) => write!(f, "{}.*", major),
        }
    }
}

impl Range {
    /// Parse a range string. An empty string matches every version.
    pub fn parse(s: &str) -> Result<Self, SemverError> {
        let raw = s.trim().to_string();
        let mut alternatives = Vec::new();

        for alternative in raw.split("||") {
            alternatives.push(Self::parse_comparator_set(alternative.trim())?);
        }

        Ok(Range { raw, alternatives })
    }

    /// Range matching every version
    pub fn any() -> Self {
        Range {
            raw: String::new(),
            alternatives: vec![vec![Constraint::Any]],
        }
    }

    fn parse_comparator_set(s: &str) -> Result<Vec<Constraint>, SemverError> {
        if s.is_empty() {
            return Ok(vec![Constraint::Any]);
        }

        // Hyphen range: 1.2.3 - 2.3.4
        if let Some((low, high_raw)) = s.split_once(" - ") {
            let low = Partial::parse(low)?;
            let high = Partial::parse(high_raw)?;
            let upper = if high.is_complete() {
                Constraint::LessThanOrEqual(high.floor())
            } else {
                match high.ceiling(high_raw)? {
                    Some(ceiling) => Constraint::LessThan(ceiling),
                    None => Constraint::Any,
                }
            };
            return Ok(vec![Constraint::GreaterThanOrEqual(low.floor()), upper]);
        }

        // Glue detached operators to their operand: ">= 1.2.3" → ">=1.2.3"
        let mut comparators = Vec::new();
        let mut pending_op: Option<&str> = None;
        for token in s.split_whitespace() {
            if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
                if pending_op.is_some() {
                    return Err(SemverError::InvalidConstraint(format!(
                        "Dangling operator in range: {}",
                        s
                    )));
                }
                pending_op = Some(token);
                continue;
            }
            let comparator = match pending_op.take() {
                Some(op) => Constraint::parse(&format!("{}{}", op, token))?,
                None => Constraint::parse(token)?,
            };
            comparators.push(comparator);
        }

        if pending_op.is_some() {
            return Err(SemverError::InvalidConstraint(format!(
                "Dangling operator in range: {}",
                s
            )));
        }

        Ok(comparators)
    }

    /// Check if a version satisfies this range.
    ///
    /// A prerelease version only matches an alternative that names a
    /// prerelease of the same MAJOR.MINOR.PATCH.
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|set| {
            if !set.iter().all(|c| c.matches(version)) {
                return false;
            }
            if !version.is_prerelease() {
                return true;
            }
            set.iter()
                .filter_map(Constraint::anchor)
                .any(|anchor| anchor.is_prerelease() && anchor.same_core(version))
        })
    }

    /// The range text as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.raw)
        }
    }
}

/// Check whether `version` satisfies `range`
pub fn satisfies(version: &str, range: &str) -> Result<bool, SemverError> {
    let version = Version::parse(version)?;
    Ok(Range::parse(range)?.matches(&version))
}

/// Check whether `version` satisfies every range in `ranges`
pub fn satisfies_all<I>(version: &str, ranges: I) -> Result<bool, SemverError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let version = Version::parse(version)?;
    for range in ranges {
        if !Range::parse(range.as_ref())?.matches(&version) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Highest version in `versions` satisfying every range in `ranges`.
///
/// Empty ranges satisfy everything, so a requirer without a constraint (the
/// root package) does not narrow the selection. Returns the version string as
/// it appeared in `versions`.
pub fn max_satisfying<V, R>(versions: V, ranges: R) -> Result<Option<String>, SemverError>
where
    V: IntoIterator,
    V::Item: AsRef<str>,
    R: IntoIterator,
    R::Item: AsRef<str>,
{
    let ranges = ranges
        .into_iter()
        .map(|r| Range::parse(r.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut best: Option<(Version, String)> = None;
    for raw in versions {
        let raw = raw.as_ref();
        let version = Version::parse(raw)?;
        if !ranges.iter().all(|r| r.matches(&version)) {
            continue;
        }
        if best.as_ref().map_or(true, |(b, _)| version > *b) {
            best = Some((version, raw.to_string()));
        }
    }

    Ok(best.map(|(_, raw)| raw))
}

/// Sort version strings lowest first
///
/// Strings that do not parse as versions sort after valid ones, in text order.
pub fn sort_versions(versions: &mut [String]) {
    versions.sort_by(|a, b| match (Version::parse(a), Version::parse(b)) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    });
}
