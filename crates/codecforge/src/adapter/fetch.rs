//! Source acquisition.
//!
//! Tarballs are hashed before anything is extracted, extraction happens in a
//! `.partial` sibling that is renamed into place at the end, and a source tree
//! is only reused when its marker names the same ref. Git sources are checked
//! out at the pinned commit and HEAD is verified afterwards.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use tracing::{debug, warn};

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::ledger::VersionPin;
use crate::workspace::sanitize_component;

const SOURCE_MARKER: &str = ".codecforge-source";

#[derive(Debug, Clone)]
pub struct Fetcher {
    pub downloads_dir: PathBuf,
    pub retries: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Locator<'a> {
    Git(&'a str),
    Http(&'a str),
    File(PathBuf),
}

fn classify(url: &str) -> Locator<'_> {
    if let Some(rest) = url.strip_prefix("git+") {
        return Locator::Git(rest);
    }
    if url.ends_with(".git") {
        return Locator::Git(url);
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Locator::File(PathBuf::from(path));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Locator::Http(url);
    }
    Locator::File(PathBuf::from(url))
}

impl Fetcher {
    /// Materialize the pinned source under `dest`. Returns `dest`.
    pub fn fetch(&self, pin: &VersionPin, dest: &Path, ctx: &ExecCtx) -> Result<PathBuf> {
        let marker = dest.join(SOURCE_MARKER);
        let fingerprint = source_fingerprint(pin);
        if fs::read_to_string(&marker).is_ok_and(|m| m.trim() == fingerprint) {
            debug!(dependency = %pin.dependency_name, "reusing source tree");
            return Ok(dest.to_path_buf());
        }
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: fetch {} @ {}", pin.source_url, pin.git_ref));
            return Ok(dest.to_path_buf());
        }
        if dest.exists() {
            fs::remove_dir_all(dest)
                .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dest.display())))?;
        }
        let partial = partial_dir(dest);
        if partial.exists() {
            fs::remove_dir_all(&partial)
                .map_err(|e| Error::msg(format!("failed to remove {}: {e}", partial.display())))?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }

        let res = match classify(&pin.source_url) {
            Locator::Git(url) => self.checkout_git(pin, url, &partial, ctx),
            Locator::Http(url) => {
                let archive = self.download_http(pin, url, ctx)?;
                self.verify_and_extract(pin, &archive, &partial, ctx)
            }
            Locator::File(path) => {
                let archive = self.copy_local(pin, &path)?;
                self.verify_and_extract(pin, &archive, &partial, ctx)
            }
        };
        if let Err(e) = res {
            let _ = fs::remove_dir_all(&partial);
            return Err(e);
        }

        fs::write(partial.join(SOURCE_MARKER), format!("{fingerprint}\n")).map_err(|e| {
            Error::msg(format!("failed to write source marker in {}: {e}", partial.display()))
        })?;
        fs::rename(&partial, dest).map_err(|e| {
            Error::msg(format!(
                "failed to rename {} -> {}: {e}",
                partial.display(),
                dest.display()
            ))
        })?;
        Ok(dest.to_path_buf())
    }

    fn archive_path(&self, pin: &VersionPin) -> PathBuf {
        let name = pin
            .source_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("source.tar.gz");
        self.downloads_dir.join(format!(
            "{}-{}-{}",
            sanitize_component(&pin.dependency_name),
            sanitize_component(&pin.git_ref),
            sanitize_component(name)
        ))
    }

    fn download_http(&self, pin: &VersionPin, url: &str, ctx: &ExecCtx) -> Result<PathBuf> {
        let out = self.archive_path(pin);
        if out.is_file()
            && let Some(expected) = pin.checksum.as_deref()
            && sha256_file_hex(&out).is_ok_and(|actual| actual == expected)
        {
            ctx.log(&format!("using cached download {}", out.display()));
            return Ok(out);
        }

        let attempts = self.retries + 1;
        let mut last = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                warn!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying download");
                std::thread::sleep(delay);
            }
            ctx.log(&format!("downloading {url} (attempt {}/{attempts})", attempt + 1));
            match download_once(url, &out) {
                Ok(()) => return Ok(out),
                Err(e) if e.is_retryable() => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| Error::msg(format!("download of {url} was never attempted"))))
    }

    fn copy_local(&self, pin: &VersionPin, path: &Path) -> Result<PathBuf> {
        if !path.is_file() {
            return Err(Error::Fetch(
                Diagnostic::new(Gate::Build, format!("source for '{}' not found", pin.dependency_name))
                    .check(Check::fail("local archive exists").with_detail(path.display().to_string()))
                    .root_cause("the ledger points at a local mirror that does not have this file")
                    .fix("populate the mirror or correct the ledger URL"),
            ));
        }
        let out = self.archive_path(pin);
        fs::create_dir_all(&self.downloads_dir).map_err(|e| {
            Error::msg(format!("failed to create {}: {e}", self.downloads_dir.display()))
        })?;
        fs::copy(path, &out).map_err(|e| {
            Error::msg(format!("failed to copy {} -> {}: {e}", path.display(), out.display()))
        })?;
        Ok(out)
    }

    fn verify_and_extract(
        &self,
        pin: &VersionPin,
        archive: &Path,
        partial: &Path,
        ctx: &ExecCtx,
    ) -> Result<()> {
        let actual = sha256_file_hex(archive)?;
        match pin.checksum.as_deref() {
            Some(expected) if expected != actual => {
                let _ = fs::remove_file(archive);
                return Err(Error::SourceIntegrity(
                    Diagnostic::new(
                        Gate::Build,
                        format!("checksum mismatch for '{}' {}", pin.dependency_name, pin.git_ref),
                    )
                    .check(Check::pass("download completed"))
                    .check(
                        Check::fail("sha256 matches ledger")
                            .with_detail(format!("expected {expected}, got {actual}")),
                    )
                    .check(Check::pass("nothing extracted, no compiler invoked"))
                    .root_cause("the archive differs from the pinned one (tampered mirror, re-rolled release, or a stale ledger)")
                    .fix(format!(
                        "confirm the upstream release and update {}_SHA256 only if the new archive is trusted",
                        crate::registry::ledger_stem(&pin.dependency_name)
                    )),
                ));
            }
            Some(_) => ctx.log(&format!("sha256 ok: {actual}")),
            None => warn!(
                dependency = %pin.dependency_name,
                sha256 = %actual,
                "no checksum pinned; archive accepted unverified"
            ),
        }
        extract_archive(archive, partial)
    }

    fn checkout_git(&self, pin: &VersionPin, url: &str, partial: &Path, ctx: &ExecCtx) -> Result<()> {
        let mut attempt = 0;
        loop {
            let mut clone = Command::new("git");
            clone
                .env("GIT_TERMINAL_PROMPT", "0")
                .arg("clone")
                .arg("--no-checkout")
                .arg(url)
                .arg(partial);
            match ctx.run_cmd(clone) {
                Ok(()) => break,
                Err(e)
                    if attempt < self.retries
                        && !ctx.cancelled()
                        && matches!(e, Error::Build(_) | Error::Timeout(_))
                        && !clone_failure_is_permanent(&e.to_string()) =>
                {
                    attempt += 1;
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(url, attempt, error = %e.kind(), "retrying clone");
                    let _ = fs::remove_dir_all(partial);
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    return Err(Error::Fetch(
                        Diagnostic::new(Gate::Build, format!("clone of {url} failed"))
                            .check(Check::fail("git clone").with_detail(e.to_string().lines().next().unwrap_or_default().to_string()))
                            .root_cause("the repository is unreachable or the URL is wrong")
                            .fix("check network access and the ledger URL"),
                    ));
                }
            }
        }

        let mut checkout = Command::new("git");
        checkout
            .arg("-C")
            .arg(partial)
            .args(["checkout", "--detach", "--quiet", &pin.git_ref]);
        ctx.run_cmd(checkout)?;

        let head = git_rev_parse(partial, "HEAD")?;
        let want = git_rev_parse(partial, &format!("{}^{{commit}}", pin.git_ref))?;
        let prefix_ok = !pin.git_ref.chars().all(|c| c.is_ascii_hexdigit())
            || head.starts_with(&pin.git_ref.to_ascii_lowercase());
        if head != want || !prefix_ok {
            return Err(Error::SourceIntegrity(
                Diagnostic::new(Gate::Build, format!("checkout of '{}' is not at the pin", pin.dependency_name))
                    .check(Check::pass("clone completed"))
                    .check(Check::fail("HEAD equals pinned commit").with_detail(format!(
                        "pinned {}, HEAD {head}",
                        pin.git_ref
                    )))
                    .root_cause("the ref resolved to a different commit than pinned")
                    .fix("pin the full commit hash in the ledger"),
            ));
        }
        let _ = fs::remove_dir_all(partial.join(".git"));
        Ok(())
    }
}

/// git exits 128 for almost everything, so go by what it printed.
fn clone_failure_is_permanent(output: &str) -> bool {
    const MARKERS: &[&str] = &[
        "authentication failed",
        "could not read username",
        "terminal prompts disabled",
        "permission denied",
        "repository not found",
        "does not appear to be a git repository",
        "does not exist",
        "requested url returned error: 4",
        "unsupported protocol",
    ];
    let lower = output.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

fn source_fingerprint(pin: &VersionPin) -> String {
    format!(
        "{} {} {}",
        pin.git_ref,
        pin.source_url,
        pin.checksum.as_deref().unwrap_or("-")
    )
}

fn partial_dir(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".into());
    dest.with_file_name(format!("{name}.partial"))
}

fn download_once(url: &str, out: &Path) -> Result<()> {
    let network = |what: &str, detail: String| {
        Error::Fetch(
            Diagnostic::new(Gate::Build, format!("download of {url} failed"))
                .check(Check::fail(what).with_detail(detail))
                .root_cause("network or server failure")
                .fix("retry later or mirror the archive and use a file:// URL in the ledger"),
        )
    };
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(600))
        .build()
        .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
    let mut res = client
        .get(url)
        .send()
        .map_err(|e| network("HTTP request", e.to_string()))?;
    if !res.status().is_success() {
        let status = res.status();
        let err = network("HTTP status", status.to_string());
        // Client errors will not fix themselves.
        return if status.is_client_error() {
            Err(Error::msg(err.to_string()))
        } else {
            Err(err)
        };
    }
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let tmp = out.with_extension("part");
    let mut file = File::create(&tmp)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", tmp.display())))?;
    if let Err(e) = res.copy_to(&mut file) {
        let _ = fs::remove_file(&tmp);
        return Err(network("HTTP body", e.to_string()));
    }
    drop(file);
    fs::rename(&tmp, out).map_err(|e| {
        Error::msg(format!("failed to rename {} -> {}: {e}", tmp.display(), out.display()))
    })
}

fn git_rev_parse(repo: &Path, rev: &str) -> Result<String> {
    let out = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["rev-parse", "--verify", "--quiet", rev])
        .output()
        .map_err(|e| Error::msg(format!("failed to run git rev-parse: {e}")))?;
    if !out.status.success() {
        return Err(Error::msg(format!(
            "git rev-parse {rev} failed in {}",
            repo.display()
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Unpack into `dest`, dropping the archive's single top-level directory.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
    let name = archive.to_string_lossy();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = File::open(archive)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", archive.display())))?;
        return unpack_stripped(Archive::new(GzDecoder::new(BufReader::new(file))), dest, archive);
    }
    if name.ends_with(".tar") {
        let file = File::open(archive)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", archive.display())))?;
        return unpack_stripped(Archive::new(BufReader::new(file)), dest, archive);
    }
    // xz, bz2 and zstd tarballs go through the system tar.
    let status = Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .arg("--strip-components=1")
        .status()
        .map_err(|e| Error::msg(format!("failed to run tar: {e}")))?;
    if !status.success() {
        return Err(Error::msg(format!(
            "tar failed to extract {}: {status}",
            archive.display()
        )));
    }
    Ok(())
}

fn unpack_stripped<R: Read>(mut archive: Archive<R>, dest: &Path, src: &Path) -> Result<()> {
    let bad = |e: std::io::Error| Error::msg(format!("failed to read {}: {e}", src.display()));
    for entry in archive.entries().map_err(bad)? {
        let mut entry = entry.map_err(bad)?;
        let path = entry.path().map_err(bad)?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(Error::msg(format!(
                "refusing archive entry '{}' in {}",
                path.display(),
                src.display()
            )));
        }
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(&stripped);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        entry.unpack(&out).map_err(|e| {
            Error::msg(format!("failed to unpack {}: {e}", out.display()))
        })?;
    }
    Ok(())
}
