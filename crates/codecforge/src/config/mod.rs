use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};

pub mod settings;

pub use settings::{BuildMode, BuildSettings, ConsumerSettings, LedgerSettings, Settings};

/// A run file after `extends` and `imports` have been inlined.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            value: Value::Table(Default::default()),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw)
            .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn table_path(&self, path: &str) -> Option<&toml::value::Table> {
        self.value_path(path).and_then(Value::as_table)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v.clone().try_into().map_err(|e| {
            Error::Config(
                Diagnostic::new(Gate::Parse, format!("invalid configuration at '{path}'"))
                    .check(Check::fail(format!("deserialize {}", self.path.display())).with_detail(
                        format!("{e}"),
                    ))
                    .root_cause("the table does not match the expected schema")
                    .fix(format!("correct the '{path}' table in {}", self.path.display())),
            )
        })?;
        Ok(Some(parsed))
    }

    /// Directory that relative paths inside the run file are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Deep-merge `overlay` into `base`; tables merge key-wise, everything else replaces.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, table: &mut toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = table.remove("imports") else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(Error::msg(format!(
            "'imports' in {} must be an array of paths",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let s = v.as_str().ok_or_else(|| {
            Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            ))
        })?;
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = take_imports(file, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let loaded = load_value(&resolve_ref_path(file, &imp), stack)?;
            merge(&mut acc, loaded);
        }
        merge(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file, v, stack)?;
    }
    Ok(())
}

fn load_value(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(tbl) = value.as_table_mut()
        && let Some(ext) = tbl.remove("extends")
    {
        let Some(ext) = ext.as_str() else {
            return Err(Error::msg(format!(
                "'extends' in {} must be a path string",
                path.display()
            )));
        };
        out = load_value(&resolve_ref_path(path, ext), stack)?;
    }

    inline_imports(path, &mut value, stack)?;
    merge(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::new();
    let value = load_value(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}
