//! `.pc` files: synthesis, reading, and resolution inside one directory.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Deterministic descriptor for a library whose build did not install one.
pub fn synthesize(
    name: &str,
    version: &str,
    prefix: &Path,
    libs: &[&str],
    private: &[String],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("prefix={}\n", prefix.display()));
    out.push_str("exec_prefix=${prefix}\n");
    out.push_str("libdir=${prefix}/lib\n");
    out.push_str("includedir=${prefix}/include\n\n");
    out.push_str(&format!("Name: {name}\n"));
    out.push_str(&format!("Description: {name} (generated)\n"));
    out.push_str(&format!("Version: {version}\n"));
    out.push_str("Cflags: -I${includedir}\n");
    if libs.is_empty() {
        out.push_str("Libs:\n");
    } else {
        let flags: Vec<String> = libs.iter().map(|l| format!("-l{l}")).collect();
        out.push_str(&format!("Libs: -L${{libdir}} {}\n", flags.join(" ")));
    }
    if !private.is_empty() {
        let flags: Vec<String> = private.iter().map(|l| format!("-l{l}")).collect();
        out.push_str(&format!("Libs.private: {}\n", flags.join(" ")));
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct PcFile {
    vars: BTreeMap<String, String>,
    fields: BTreeMap<String, String>,
}

impl PcFile {
    pub fn parse(text: &str) -> Self {
        let mut pc = Self::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let colon = line.find(':');
            let equals = line.find('=');
            match (colon, equals) {
                (Some(c), Some(e)) if e < c => pc.set_var(&line[..e], &line[e + 1..]),
                (None, Some(e)) => pc.set_var(&line[..e], &line[e + 1..]),
                (Some(c), _) => {
                    let value = pc.expand(line[c + 1..].trim());
                    pc.fields.insert(line[..c].trim().to_string(), value);
                }
                (None, None) => {}
            }
        }
        pc
    }

    fn set_var(&mut self, key: &str, raw: &str) {
        let value = self.expand(raw.trim());
        self.vars.insert(key.trim().to_string(), value);
    }

    /// `${var}` references expand against earlier definitions; unknown ones become empty.
    fn expand(&self, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    if let Some(v) = self.vars.get(&after[..end]) {
                        out.push_str(v);
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Package names from `Requires` and `Requires.private`, without version constraints.
    pub fn requires(&self) -> Vec<String> {
        let mut out = Vec::new();
        for key in ["Requires", "Requires.private"] {
            let Some(raw) = self.field(key) else {
                continue;
            };
            let mut skip_next = false;
            for tok in raw.split(|c: char| c == ',' || c.is_whitespace()) {
                if tok.is_empty() {
                    continue;
                }
                if skip_next {
                    skip_next = false;
                    continue;
                }
                if matches!(tok, "=" | "<" | ">" | "<=" | ">=" | "!=") {
                    skip_next = true;
                    continue;
                }
                out.push(tok.to_string());
            }
        }
        out
    }
}

pub fn pc_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.pc"))
}

/// Names that fail to resolve when looking up `name` strictly inside `dir`,
/// following `Requires` transitively. Empty means it resolves.
pub fn unresolved_in_dir(dir: &Path, name: &str) -> Vec<String> {
    let mut missing = Vec::new();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([name.to_string()]);
    while let Some(next) = queue.pop_front() {
        if !seen.insert(next.clone()) {
            continue;
        }
        match fs::read_to_string(pc_path(dir, &next)) {
            Ok(text) => queue.extend(PcFile::parse(&text).requires()),
            Err(_) => missing.push(next),
        }
    }
    missing
}

/// Stems of every `.pc` file in `dir`, sorted.
pub fn list_pc_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "pc"))
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    out.sort();
    out
}

/// Add `-l<lib>` entries missing from `Libs.private`. Returns whether the file changed.
pub fn append_private_libs(path: &Path, libs: &[String]) -> Result<bool> {
    if libs.is_empty() {
        return Ok(false);
    }
    let text = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    let (updated, changed) = with_private_libs(&text, libs);
    if changed {
        fs::write(path, updated)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
    }
    Ok(changed)
}

fn with_private_libs(text: &str, libs: &[String]) -> (String, bool) {
    let wanted: Vec<String> = libs.iter().map(|l| format!("-l{l}")).collect();
    let mut out = Vec::new();
    let mut found = false;
    let mut changed = false;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Libs.private:") {
            found = true;
            let mut tokens: Vec<&str> = rest.split_whitespace().collect();
            for w in &wanted {
                if !tokens.contains(&w.as_str()) {
                    tokens.push(w);
                    changed = true;
                }
            }
            out.push(format!("Libs.private: {}", tokens.join(" ")));
        } else {
            out.push(line.to_string());
        }
    }
    if !found {
        out.push(format!("Libs.private: {}", wanted.join(" ")));
        changed = true;
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    (joined, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_descriptor_is_stable_and_parses() {
        let a = synthesize("ffnvcodec", "n12.1.14.0", Path::new("/o/p"), &[], &[]);
        let b = synthesize("ffnvcodec", "n12.1.14.0", Path::new("/o/p"), &[], &[]);
        assert_eq!(a, b);

        let text = synthesize("x264", "31e19f92", Path::new("/o/p"), &["x264"], &["pthread".into()]);
        let pc = PcFile::parse(&text);
        assert_eq!(pc.var("libdir"), Some("/o/p/lib"));
        assert_eq!(pc.field("Libs"), Some("-L/o/p/lib -lx264"));
        assert_eq!(pc.field("Libs.private"), Some("-lpthread"));
        assert_eq!(pc.field("Version"), Some("31e19f92"));
    }

    #[test]
    fn requires_drop_version_constraints() {
        let pc = PcFile::parse("Requires: ogg >= 1.3.0, foo\nRequires.private: bar = 2\n");
        assert_eq!(pc.requires(), vec!["ogg", "foo", "bar"]);
    }

    #[test]
    fn resolution_follows_requires_inside_the_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(pc_path(tmp.path(), "vorbis"), "Name: vorbis\nRequires: ogg\n").expect("write");
        assert_eq!(unresolved_in_dir(tmp.path(), "vorbis"), vec!["ogg"]);

        fs::write(pc_path(tmp.path(), "ogg"), "Name: ogg\n").expect("write");
        assert!(unresolved_in_dir(tmp.path(), "vorbis").is_empty());
        assert_eq!(list_pc_files(tmp.path()), vec!["ogg", "vorbis"]);
    }

    #[test]
    fn private_libs_are_appended_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = pc_path(tmp.path(), "x265");
        fs::write(&path, "Name: x265\nLibs: -lx265\nLibs.private: -lm\n").expect("write");
        let libs = vec!["stdc++".to_string(), "m".to_string()];

        assert!(append_private_libs(&path, &libs).expect("append"));
        let first = fs::read_to_string(&path).expect("read");
        assert!(first.contains("Libs.private: -lm -lstdc++"), "{first}");

        assert!(!append_private_libs(&path, &libs).expect("append"));
        assert_eq!(fs::read_to_string(&path).expect("read"), first);
    }
}
