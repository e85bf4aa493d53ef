//! Pinned upstream versions.
//!
//! The ledger is a flat `KEY=value` file maintained by an external updater:
//!
//! ```text
//! # Last updated: 2026-09-30
//! X264_VERSION=31e19f92f00c7003fa115047ce50978bc98c3a0d
//! X264_URL=https://code.videolan.org/videolan/x264.git
//! OPUS_VERSION=1.5.2
//! OPUS_URL=https://downloads.xiph.org/releases/opus/opus-1.5.2.tar.gz
//! OPUS_SHA256=65c1d2f78b9f2fb20082c38cbe47c951ad5839345876e46941612ee87f9a7ce1
//! ```
//!
//! Refs are validated while loading: a mutable alias would make every stamp
//! keyed on it meaningless, so it is a hard error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::registry::ledger_stem;

const MUTABLE_ALIASES: [&str; 4] = ["stable", "master", "main", "HEAD"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPin {
    pub dependency_name: String,
    pub git_ref: String,
    pub source_url: String,
    /// Lowercase hex sha256 of the downloaded archive.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct RawPin {
    version: Option<(usize, String)>,
    url: Option<String>,
    sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    pub source: PathBuf,
    pub last_updated: Option<String>,
    pins: BTreeMap<String, VersionPin>,
}

impl Ledger {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed to read ledger {}: {e}", path.display())))?;
        Self::parse(path, &raw)
    }

    pub fn parse(source: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let source = source.into();
        let mut last_updated = None;
        let mut entries = BTreeMap::<String, RawPin>::new();

        for (idx, line) in raw.lines().enumerate() {
            let lineno = idx + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                if last_updated.is_none()
                    && let Some(date) = header_date(comment)
                {
                    last_updated = Some(date);
                }
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                return Err(parse_error(
                    &source,
                    lineno,
                    "expected KEY=value",
                    "remove the line or turn it into a '#' comment",
                ));
            };
            let key = key.trim();
            let value = unquote(value.trim());

            if let Some(stem) = key.strip_suffix("_VERSION") {
                entries.entry(stem.to_string()).or_default().version = Some((lineno, value));
            } else if let Some(stem) = key.strip_suffix("_URL") {
                entries.entry(stem.to_string()).or_default().url = Some(value);
            } else if let Some(stem) = key.strip_suffix("_SHA256") {
                entries.entry(stem.to_string()).or_default().sha256 = Some(value);
            } else {
                debug!(key, line = lineno, "ignoring unrecognised ledger key");
            }
        }

        let mut pins = BTreeMap::new();
        for (stem, raw_pin) in entries {
            let Some((lineno, version)) = raw_pin.version else {
                return Err(parse_error(
                    &source,
                    0,
                    &format!("{stem}_URL or {stem}_SHA256 without {stem}_VERSION"),
                    &format!("add {stem}_VERSION=<commit or release>"),
                ));
            };
            validate_ref(&source, lineno, &stem, &version)?;
            let Some(url) = raw_pin.url.filter(|u| !u.is_empty()) else {
                return Err(parse_error(
                    &source,
                    lineno,
                    &format!("{stem}_VERSION has no {stem}_URL"),
                    &format!("add {stem}_URL=<source locator>"),
                ));
            };
            let checksum = match raw_pin.sha256.filter(|s| !s.is_empty()) {
                Some(sum) => Some(validate_checksum(&source, &stem, &sum)?),
                None => None,
            };
            pins.insert(
                stem.clone(),
                VersionPin {
                    dependency_name: stem.to_ascii_lowercase(),
                    git_ref: version,
                    source_url: url,
                    checksum,
                },
            );
        }

        Ok(Self {
            source,
            last_updated,
            pins,
        })
    }

    /// Pin for a registry name (`svt-av1` reads `SVT_AV1_*`).
    pub fn resolve(&self, name: &str) -> Result<VersionPin> {
        let stem = ledger_stem(name);
        let Some(pin) = self.pins.get(&stem) else {
            return Err(Error::UnknownDependency(
                Diagnostic::new(Gate::Parse, format!("no ledger pin for '{name}'"))
                    .check(
                        Check::fail(format!("lookup {stem}_VERSION"))
                            .with_detail(format!("ledger {}", self.source.display())),
                    )
                    .root_cause(format!(
                        "'{name}' is active for this run but the ledger does not pin it"
                    ))
                    .fix(format!(
                        "add {stem}_VERSION and {stem}_URL to {}",
                        self.source.display()
                    )),
            ));
        };
        Ok(VersionPin {
            dependency_name: name.to_string(),
            ..pin.clone()
        })
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

fn header_date(comment: &str) -> Option<String> {
    let (label, rest) = comment.split_once(':')?;
    let label = label.trim().to_ascii_lowercase();
    (label == "last updated" || label == "updated")
        .then(|| rest.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn unquote(v: &str) -> String {
    for q in ['"', '\''] {
        if let Some(inner) = v.strip_prefix(q).and_then(|s| s.strip_suffix(q)) {
            return inner.to_string();
        }
    }
    v.to_string()
}

fn validate_ref(source: &Path, lineno: usize, stem: &str, version: &str) -> Result<()> {
    let alias = MUTABLE_ALIASES
        .iter()
        .find(|a| a.eq_ignore_ascii_case(version));
    if let Some(alias) = alias {
        return Err(Error::InvalidRef(
            Diagnostic::new(
                Gate::Parse,
                format!("{stem}_VERSION uses the mutable ref \"{version}\""),
            )
            .check(Check::fail("ref is not a mutable alias").with_detail(format!(
                "\"{version}\" matches denied alias \"{alias}\" ({}:{lineno})",
                source.display()
            )))
            .root_cause(format!(
                "\"{version}\" moves over time, so any stamp keyed on it can describe a different source tree"
            ))
            .fix(format!(
                "pin a commit hash (or numeric release) instead: {stem}_VERSION=<40-char commit hash>"
            )),
        ));
    }
    if is_commit_hash(version) || is_numeric_version(version) {
        return Ok(());
    }
    Err(Error::InvalidRef(
        Diagnostic::new(
            Gate::Parse,
            format!("{stem}_VERSION \"{version}\" is not content-addressable"),
        )
        .check(Check::pass("ref is not a mutable alias"))
        .check(
            Check::fail("ref is a commit hash or numeric version")
                .with_detail(format!("{}:{lineno}", source.display())),
        )
        .root_cause("branch and tag names can be moved, breaking cache correctness")
        .fix(format!("pin a commit hash: {stem}_VERSION=<commit hash>")),
    ))
}

fn is_commit_hash(v: &str) -> bool {
    (7..=40).contains(&v.len()) && v.chars().all(|c| c.is_ascii_hexdigit())
}

/// `1.5.2`, `v2.3.0`, `3.100`.
fn is_numeric_version(v: &str) -> bool {
    let v = v.strip_prefix('v').unwrap_or(v);
    !v.is_empty()
        && v.split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

fn validate_checksum(source: &Path, stem: &str, sum: &str) -> Result<String> {
    let sum = sum.trim().to_ascii_lowercase();
    if sum.len() == 64 && sum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(sum);
    }
    Err(parse_error(
        source,
        0,
        &format!("{stem}_SHA256 is not a 64-digit hex sha256"),
        &format!("correct {stem}_SHA256 or remove it"),
    ))
}

fn parse_error(source: &Path, lineno: usize, what: &str, fix: &str) -> Error {
    let at = if lineno > 0 {
        format!("{}:{lineno}", source.display())
    } else {
        source.display().to_string()
    };
    Error::Config(
        Diagnostic::new(Gate::Parse, format!("malformed ledger: {what}"))
            .check(Check::fail("parse ledger").with_detail(at))
            .root_cause("the ledger file does not follow the KEY=value layout")
            .fix(fix.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Last updated: 2026-09-30
# pinned by the updater

X264_VERSION=31e19f92f00c7003fa115047ce50978bc98c3a0d
X264_URL=https://code.videolan.org/videolan/x264.git
SVT_AV1_VERSION=\"v2.3.0\"
SVT_AV1_URL=https://gitlab.com/AOMediaCodec/SVT-AV1/-/archive/v2.3.0/SVT-AV1-v2.3.0.tar.gz
SVT_AV1_SHA256=ABABABABABABABABABABABABABABABABABABABABABABABABABABABABABABABAB
";

    #[test]
    fn parses_pins_and_header() {
        let ledger = Ledger::parse("versions.env", SAMPLE).expect("parse");
        assert_eq!(ledger.last_updated.as_deref(), Some("2026-09-30"));
        assert_eq!(ledger.len(), 2);

        let pin = ledger.resolve("svt-av1").expect("svt-av1");
        assert_eq!(pin.dependency_name, "svt-av1");
        assert_eq!(pin.git_ref, "v2.3.0");
        let expected = "ab".repeat(32);
        assert_eq!(pin.checksum.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn mutable_alias_is_invalid_ref() {
        let err = Ledger::parse(
            "versions.env",
            "X264_VERSION=stable\nX264_URL=https://example.invalid/x264.git\n",
        )
        .expect_err("stable must be rejected");
        assert_eq!(err.kind(), "InvalidRefError");
        let text = err.to_string();
        assert!(text.contains("\"stable\""), "{text}");
        assert!(text.contains("pin a commit hash"), "{text}");
    }

    #[test]
    fn aliases_are_matched_case_insensitively() {
        let err = Ledger::parse("v", "AOM_VERSION=head\nAOM_URL=x\n").expect_err("head");
        assert_eq!(err.kind(), "InvalidRefError");
    }

    #[test]
    fn branch_names_are_not_content_addressable() {
        let err = Ledger::parse("v", "AOM_VERSION=release-candidate\nAOM_URL=x\n")
            .expect_err("branch");
        assert_eq!(err.kind(), "InvalidRefError");
    }

    #[test]
    fn missing_url_is_rejected() {
        let err = Ledger::parse("v", "AOM_VERSION=3.9.1\n").expect_err("url");
        assert!(err.to_string().contains("AOM_URL"));
    }

    #[test]
    fn unknown_name_is_unknown_dependency() {
        let ledger = Ledger::parse("versions.env", SAMPLE).expect("parse");
        let err = ledger.resolve("dav1d").expect_err("absent");
        assert_eq!(err.kind(), "UnknownDependencyError");
        assert!(err.to_string().contains("DAV1D_VERSION"));
    }
}
