//! npm range matching on top of `semver`.
//!
//! npm ranges are translated into one [`VersionReq`] per `||` alternative.

use super::error::PkgError;
use semver::{Version, VersionReq};

/// A parsed npm range: matches when any alternative matches.
#[derive(Debug, Clone)]
pub struct Range {
    alternatives: Vec<VersionReq>,
}

impl Range {
    /// Parse an npm range such as `^1.0.0 || >= 2.1.2 < 3.0.0`.
    ///
    /// # Errors
    /// Returns an error if no alternative is a valid range.
    pub fn parse(range: &str) -> Result<Self, PkgError> {
        let mut alternatives = Vec::new();
        let mut last_err = None;

        for alt in range.split("||").map(str::trim) {
            if alt.is_empty() {
                continue;
            }
            match parse_comparators(alt) {
                Ok(req) => alternatives.push(req),
                Err(e) => last_err = Some(e),
            }
        }

        if alternatives.is_empty() {
            return Err(last_err.unwrap_or_else(|| {
                PkgError::spec_invalid(format!("Invalid version range '{range}'"))
            }));
        }

        Ok(Self { alternatives })
    }

    /// Check a version against the range.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

/// Whether `range` parses as an npm range.
#[must_use]
pub fn is_valid_range(range: &str) -> bool {
    Range::parse(range).is_ok()
}

/// Check whether `version` satisfies `range`.
///
/// Returns false when either side fails to parse.
#[must_use]
pub fn version_satisfies(version: &str, range: &str) -> bool {
    let Ok(version) = Version::parse(version) else {
        return false;
    };
    Range::parse(range).is_ok_and(|r| r.matches(&version))
}

/// Pick the highest version in `versions` that satisfies `range`.
///
/// # Errors
/// Returns an error if the range is invalid.
pub fn max_satisfying<'a>(
    versions: impl IntoIterator<Item = &'a str>,
    range: &str,
) -> Result<Option<String>, PkgError> {
    let range = Range::parse(range)?;

    Ok(versions
        .into_iter()
        .filter_map(|v| Version::parse(v).ok())
        .filter(|v| range.matches(v))
        .max()
        .map(|v| v.to_string()))
}

/// Parse a single comparator set, handling npm-specific syntax.
///
/// Handles:
/// - Standard semver ranges: ^1.0.0, ~1.0.0, >=1.0.0, etc.
/// - Bare versions, which npm treats as exact: 1.2.3
/// - Hyphen ranges: 1.0.0 - 2.0.0
/// - X-ranges: 1.x, 1.0.x, *
/// - Space-separated comparators: >= 2.1.2 < 3.0.0
fn parse_comparators(range: &str) -> Result<VersionReq, PkgError> {
    let range = range.trim();
    let invalid = |e: semver::Error| {
        PkgError::spec_invalid(format!("Invalid version range '{range}': {e}"))
    };

    if Version::parse(range).is_ok() {
        return VersionReq::parse(&format!("={range}")).map_err(invalid);
    }

    if let Some((start, end)) = parse_hyphen_range(range) {
        return VersionReq::parse(&format!(">={start}, <={end}")).map_err(invalid);
    }

    if range.contains('x') || range.contains('X') || range == "*" || range.is_empty() {
        return VersionReq::parse(&convert_x_range(range)).map_err(invalid);
    }

    VersionReq::parse(&convert_space_separated_comparators(range)).map_err(invalid)
}

/// Parse a hyphen range like "1.0.0 - 2.0.0".
fn parse_hyphen_range(range: &str) -> Option<(&str, &str)> {
    let (start, end) = range.split_once(" - ")?;
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() || end.is_empty() {
        return None;
    }
    Some((start, end))
}

/// Join space-separated comparators with commas.
///
/// npm reads `>= 2.1.2 < 3.0.0` as `>=2.1.2 AND <3.0.0`; `semver` wants
/// `>=2.1.2, <3.0.0`. Operators separated from their version by a space are
/// glued back on.
fn convert_space_separated_comparators(range: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut pending_op = String::new();

    for token in range.split_whitespace() {
        if token.chars().any(|c| c.is_ascii_digit()) {
            parts.push(format!("{pending_op}{token}"));
            pending_op.clear();
        } else {
            pending_op.push_str(token);
        }
    }

    if !pending_op.is_empty() {
        parts.push(pending_op);
    }

    parts.join(", ")
}

/// Convert x-range to semver range.
fn convert_x_range(range: &str) -> String {
    if matches!(range, "" | "*" | "x" | "X") {
        return ">=0.0.0".to_string();
    }

    let parts: Vec<&str> = range.split('.').collect();

    match parts.as_slice() {
        [major, "x" | "X" | "*"] | [major, "x" | "X" | "*", "x" | "X" | "*"] => {
            if let Ok(m) = major.parse::<u64>() {
                return format!(">={m}.0.0, <{}.0.0", m + 1);
            }
        }
        [major, minor, "x" | "X" | "*"] => {
            if let (Ok(m), Ok(n)) = (major.parse::<u64>(), minor.parse::<u64>()) {
                return format!(">={m}.{n}.0, <{m}.{}.0", n + 1);
            }
        }
        _ => {}
    }

    range.replace(['x', 'X'], "0")
}
