//! Prebuilt or header-only trees: copy `include/` and `lib/` into the prefix.

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::adapter::BuildRequest;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

pub fn install(req: &BuildRequest<'_>, src: &Path, ctx: &ExecCtx) -> Result<()> {
    if ctx.dry_run {
        ctx.log(&format!("DRY-RUN: copy {} into {}", src.display(), req.prefix.root.display()));
        return Ok(());
    }
    let mut copied = 0usize;
    for sub in ["include", "lib"] {
        let from = src.join(sub);
        if from.is_dir() {
            copied += copy_tree(&from, &req.prefix.root.join(sub))?;
        }
    }
    ctx.log(&format!("installed {copied} file(s) from {}", src.display()));
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    let mut n = 0;
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &dest).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} -> {}: {e}",
                    entry.path().display(),
                    dest.display()
                ))
            })?;
            n += 1;
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::{prefix, target};
    use crate::executor::NullSink;
    use crate::platform::PlatformCatalog;
    use std::sync::Arc;

    #[test]
    fn copies_headers_into_the_prefix() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("nv-codec-headers");
        fs::create_dir_all(src.join("include/ffnvcodec")).expect("mkdir");
        fs::write(src.join("include/ffnvcodec/nvEncodeAPI.h"), "/* api */\n").expect("write");
        fs::write(src.join("Makefile"), "all:\n").expect("write");

        let prefix = prefix(tmp.path());
        let cat = PlatformCatalog::builtin();
        let t = target("nv-codec-headers");
        let req = BuildRequest {
            target: &t,
            platform: cat.get("linux-aarch64-gnu").expect("platform"),
            prefix: &prefix,
            debug: false,
            jobs: 1,
        };
        install(&req, &src, &ExecCtx::new(false, Arc::new(NullSink))).expect("install");
        assert!(prefix.include_dir().join("ffnvcodec/nvEncodeAPI.h").is_file());
        assert!(!prefix.root.join("Makefile").exists());
    }
}
