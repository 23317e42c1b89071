//! Package spec parsing.
//!
//! Turns install arguments and manifest entries into [`PackageSpec`]s:
//! - `react`, `react@18.2.0`, `react@^18.0.0`, `react@next`
//! - `@types/node`, `@types/node@^20`
//! - `file:../local-pkg`, `link:../local-pkg`, `./local-pkg`, `foo@file:../foo`

use super::error::PkgError;
use super::version::is_valid_range;
use std::path::{Path, PathBuf};

/// Default dist-tag for bare names.
pub const DEFAULT_TAG: &str = "latest";

/// What kind of specifier a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecType {
    /// An exact version, e.g. `1.2.3`.
    Version,
    /// A semver range, e.g. `^1.0.0`.
    Range,
    /// A dist-tag, e.g. `latest`.
    Tag,
    /// A package directory on the local filesystem.
    Directory,
}

/// A requested dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// Full package name. Empty for a bare directory argument until the
    /// directory's manifest is read.
    pub name: String,
    /// The request as written, e.g. `foo@^1.0.0`.
    pub raw: String,
    /// The specifier part, e.g. `^1.0.0`. Empty when none was given.
    pub raw_spec: String,
    /// Kind of specifier.
    pub spec_type: SpecType,
    /// What to resolve: the version, range, tag, or absolute directory.
    pub fetch_spec: String,
    /// Requested as a dev dependency.
    pub dev: bool,
    /// Requested as an optional dependency.
    pub optional: bool,
}

impl PackageSpec {
    /// Parse an install argument.
    ///
    /// Relative directory specs are resolved against `where_dir`.
    ///
    /// # Errors
    /// Returns an error if the spec is invalid.
    pub fn parse(input: &str, where_dir: &Path) -> Result<Self, PkgError> {
        let input = input.trim();

        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        if is_directory_spec(input) {
            return Ok(Self::directory(String::new(), input, input, where_dir));
        }

        let (name, raw_spec) = split_name(input)?;
        validate_name(name)?;
        Ok(Self::from_parts(name, raw_spec, input, where_dir))
    }

    /// Build a spec from a manifest entry (`"name": "range"`).
    ///
    /// # Errors
    /// Returns an error if the name is invalid.
    pub fn from_dependency(name: &str, spec: &str, where_dir: &Path) -> Result<Self, PkgError> {
        validate_name(name)?;
        let spec = spec.trim();
        let raw = if spec.is_empty() {
            name.to_string()
        } else {
            format!("{name}@{spec}")
        };
        Ok(Self::from_parts(name, spec, &raw, where_dir))
    }

    fn from_parts(name: &str, raw_spec: &str, raw: &str, where_dir: &Path) -> Self {
        if is_directory_spec(raw_spec) {
            return Self::directory(name.to_string(), raw_spec, raw, where_dir);
        }

        let (spec_type, fetch_spec) = if raw_spec.is_empty() {
            (SpecType::Tag, DEFAULT_TAG.to_string())
        } else if semver::Version::parse(raw_spec).is_ok() {
            (SpecType::Version, raw_spec.to_string())
        } else if is_valid_range(raw_spec) {
            (SpecType::Range, raw_spec.to_string())
        } else {
            (SpecType::Tag, raw_spec.to_string())
        };

        Self {
            name: name.to_string(),
            raw: raw.to_string(),
            raw_spec: raw_spec.to_string(),
            spec_type,
            fetch_spec,
            dev: false,
            optional: false,
        }
    }

    fn directory(name: String, raw_spec: &str, raw: &str, where_dir: &Path) -> Self {
        let rel = raw_spec
            .strip_prefix("file:")
            .or_else(|| raw_spec.strip_prefix("link:"))
            .unwrap_or(raw_spec);
        let dir: PathBuf = where_dir.join(rel);

        Self {
            name,
            raw: raw.to_string(),
            raw_spec: raw_spec.to_string(),
            spec_type: SpecType::Directory,
            fetch_spec: dir.to_string_lossy().into_owned(),
            dev: false,
            optional: false,
        }
    }

    /// Mark the spec as dev and/or optional.
    #[must_use]
    pub fn with_flags(mut self, dev: bool, optional: bool) -> Self {
        self.dev = dev;
        self.optional = optional;
        self
    }

    /// Replace the tag used for a bare name.
    #[must_use]
    pub fn with_default_tag(mut self, tag: &str) -> Self {
        if self.spec_type == SpecType::Tag && self.raw_spec.is_empty() {
            self.fetch_spec = tag.to_string();
        }
        self
    }

    /// The specifier to write back into `package.json`.
    ///
    /// Registry requests are saved as `^<version>` (or the exact version
    /// when `save_exact` is set); directory requests keep a `file:` spec.
    #[must_use]
    pub fn save_spec(&self, resolved_version: &str, save_exact: bool) -> String {
        match self.spec_type {
            SpecType::Version | SpecType::Range | SpecType::Tag => {
                if save_exact {
                    resolved_version.to_string()
                } else {
                    format!("^{resolved_version}")
                }
            }
            SpecType::Directory => {
                if self.raw_spec.starts_with("file:") || self.raw_spec.starts_with("link:") {
                    self.raw_spec.clone()
                } else {
                    format!("file:{}", self.raw_spec)
                }
            }
        }
    }

    /// Check if this is a scoped package.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.name.starts_with('@')
    }

    /// URL-encode the package name for registry requests.
    ///
    /// For scoped packages, encodes the `/` as `%2F`.
    #[must_use]
    pub fn url_encoded_name(&self) -> String {
        if self.is_scoped() {
            self.name.replace('/', "%2F")
        } else {
            self.name.clone()
        }
    }
}

fn is_directory_spec(spec: &str) -> bool {
    spec.starts_with("file:")
        || spec.starts_with("link:")
        || spec.starts_with("./")
        || spec.starts_with("../")
        || spec.starts_with('/')
        || spec == "."
        || spec == ".."
}

/// Split `name@spec` into its parts, keeping the leading `@` of a scope.
fn split_name(input: &str) -> Result<(&str, &str), PkgError> {
    let search_from = usize::from(input.starts_with('@'));

    if search_from == 1 {
        let Some(slash_pos) = input.find('/') else {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: missing '/' in '{input}'"
            )));
        };
        if slash_pos == 1 {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty scope in '{input}'"
            )));
        }
    }

    match input[search_from..].find('@') {
        Some(pos) => {
            let at = pos + search_from;
            let spec = &input[at + 1..];
            if spec.is_empty() {
                return Err(PkgError::spec_invalid(format!(
                    "Invalid package spec: empty version range in '{input}'"
                )));
            }
            Ok((&input[..at], spec))
        }
        None => Ok((input, "")),
    }
}

fn validate_name(name: &str) -> Result<(), PkgError> {
    let bare = if let Some(scoped) = name.strip_prefix('@') {
        let Some((scope, rest)) = scoped.split_once('/') else {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: missing '/' in '{name}'"
            )));
        };
        if scope.is_empty() || rest.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty scope or name in '{name}'"
            )));
        }
        check_chars(scope, name)?;
        rest
    } else {
        name
    };

    if bare.is_empty() {
        return Err(PkgError::spec_invalid("Empty package name"));
    }
    check_chars(bare, name)
}

fn check_chars(part: &str, name: &str) -> Result<(), PkgError> {
    for c in part.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(PkgError::spec_invalid(format!(
                "Invalid character '{c}' in package name '{name}'"
            )));
        }
    }
    Ok(())
}
