use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::license::Tier;

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Out,
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn downloads_dir(&self) -> PathBuf {
        self.build_dir.join("downloads")
    }

    pub fn stamps_dir(&self) -> PathBuf {
        self.build_dir.join("stamps")
    }

    pub fn prefix(&self, platform_id: &str, tier: Tier) -> IsolatedPrefix {
        IsolatedPrefix {
            root: self.out_dir.join(platform_id).join(tier.as_str()),
            work: self.build_dir.join(platform_id).join(tier.as_str()),
            logs: self
                .build_dir
                .join("logs")
                .join(platform_id)
                .join(tier.as_str()),
            pkg_config_override: None,
        }
    }
}

/// The private install tree for one platform + tier.
///
/// Each target owns only the files it installs here; everything else in the
/// tree belongs to other targets and must not be rewritten.
#[derive(Debug, Clone)]
pub struct IsolatedPrefix {
    pub root: PathBuf,
    work: PathBuf,
    logs: PathBuf,
    pkg_config_override: Option<PathBuf>,
}

impl IsolatedPrefix {
    pub fn with_pkg_config_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.pkg_config_override = dir;
        self
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn include_dir(&self) -> PathBuf {
        self.root.join("include")
    }

    /// The only directory pkg-config may search during this run.
    pub fn pkg_config_dir(&self) -> PathBuf {
        self.pkg_config_override
            .clone()
            .unwrap_or_else(|| self.lib_dir().join("pkgconfig"))
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.work.join("src")
    }

    pub fn build_dir_for(&self, target: &str) -> PathBuf {
        self.work.join("build").join(target)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.work.join("scratch")
    }

    pub fn log_path(&self, target: &str) -> PathBuf {
        self.logs.join(format!("{}.log", sanitize_component(target)))
    }

    /// Environment that confines pkg-config to the isolated tree.
    pub fn pkg_config_env(&self) -> Vec<(String, String)> {
        vec![
            (
                "PKG_CONFIG_LIBDIR".into(),
                self.pkg_config_dir().display().to_string(),
            ),
            ("PKG_CONFIG_PATH".into(), String::new()),
            ("PKG_CONFIG_SYSTEM_INCLUDE_PATH".into(), String::new()),
            ("PKG_CONFIG_SYSTEM_LIBRARY_PATH".into(), String::new()),
        ]
    }

    pub fn create_layout(&self) -> Result<()> {
        for dir in [
            self.bin_dir(),
            self.lib_dir(),
            self.pkg_config_dir(),
            self.include_dir(),
            self.sources_dir(),
            self.scratch_dir(),
            self.logs.clone(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
        }
        Ok(())
    }
}

pub fn load_paths(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let root = resolve_user_path(base, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let out_dir = resolve_user_dir(&root, &cfg.out_dir)?;
    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg, base)?;

    match cfg.clean {
        CleanMode::None => {}
        CleanMode::Build => safe_remove_dir_all(&paths.root, &paths.build_dir)?,
        CleanMode::Out => {
            // stamps vouch for prefix contents
            safe_remove_dir_all(&paths.root, &paths.out_dir)?;
            safe_remove_dir_all(&paths.root, &paths.stamps_dir())?;
        }
        CleanMode::All => {
            safe_remove_dir_all(&paths.root, &paths.build_dir)?;
            safe_remove_dir_all(&paths.root, &paths.out_dir)?;
        }
    }

    for dir in [&paths.build_dir, &paths.out_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (not strictly inside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}

pub fn sanitize_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "target".into() } else { out }
}
