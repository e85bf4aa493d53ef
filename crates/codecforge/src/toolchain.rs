//! Host tools the verification gates rely on.
//!
//! Everything that shells out for inspection goes through [`Toolchain`], so
//! the gates can be exercised with an in-process fake.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use walkdir::WalkDir;

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::platform::PlatformDescriptor;

/// Dynamic linking facts about a final binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Linkage {
    /// ELF `PT_INTERP`; `None` for static executables and non-ELF formats.
    pub interpreter: Option<String>,
    pub needed: Vec<String>,
}

pub trait Toolchain: Send + Sync {
    /// Compile a trivial C translation unit with the platform's compiler and
    /// flags, returning the produced object.
    fn compile_probe(&self, platform: &PlatformDescriptor, scratch: &Path) -> Result<PathBuf>;

    /// `file(1)`-style description. Archives are described by their first member.
    fn describe(&self, platform: &PlatformDescriptor, path: &Path) -> Result<String>;

    /// Whether pkg-config, run with exactly `env` applied, resolves `name`.
    fn pkg_config_resolves(
        &self,
        platform: &PlatformDescriptor,
        name: &str,
        env: &[(String, String)],
    ) -> Result<bool>;

    fn linkage(&self, platform: &PlatformDescriptor, binary: &Path) -> Result<Linkage>;
}

/// Shells out to the real compiler, `file`, `ar`, `pkg-config`, `readelf`, `otool` and `objdump`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemToolchain;

const PROBE_SOURCE: &str = "int codecforge_probe(int x) { return x * 2; }\n";

/// Split a compiler setting such as `clang --target=aarch64-linux-gnu` into program and args.
pub fn split_command(raw: &str) -> Option<(String, Vec<String>)> {
    let mut parts = raw.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

fn output_of(mut cmd: Command, tool: &str) -> Result<Output> {
    cmd.output().map_err(|e| {
        Error::Toolchain(
            Diagnostic::new(Gate::Preflight, format!("cannot run '{tool}'"))
                .check(Check::fail(format!("spawn {tool}")).with_detail(e.to_string()))
                .root_cause(format!("'{tool}' is not installed or not on PATH"))
                .fix(format!("install '{tool}' or point the platform record at the right binary")),
        )
    })
}

fn stderr_line(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr)
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(crate::logs::sanitize_line)
        .unwrap_or_default()
}

impl Toolchain for SystemToolchain {
    fn compile_probe(&self, platform: &PlatformDescriptor, scratch: &Path) -> Result<PathBuf> {
        fs::create_dir_all(scratch)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", scratch.display())))?;
        let src = scratch.join("probe.c");
        let obj = scratch.join("probe.o");
        fs::write(&src, PROBE_SOURCE)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", src.display())))?;
        let _ = fs::remove_file(&obj);

        let Some((program, args)) = split_command(&platform.cc) else {
            return Err(Error::msg(format!("platform '{}' has no compiler", platform.id)));
        };
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .args(&platform.cflags)
            .arg("-c")
            .arg(&src)
            .arg("-o")
            .arg(&obj);
        let out = output_of(cmd, &program)?;
        if !out.status.success() || !obj.is_file() {
            return Err(Error::Toolchain(
                Diagnostic::new(
                    Gate::Preflight,
                    format!("probe compile failed for '{}'", platform.id),
                )
                .check(Check::pass(format!("found compiler {program}")))
                .check(Check::fail("compile probe.c").with_detail(stderr_line(&out)))
                .root_cause("the compiler rejects the platform's cflags or lacks a target sysroot")
                .fix(format!(
                    "run `{} {} -c probe.c` by hand and fix the toolchain setup",
                    platform.cc,
                    platform.cflags.join(" ")
                )),
            ));
        }
        Ok(obj)
    }

    fn describe(&self, _platform: &PlatformDescriptor, path: &Path) -> Result<String> {
        if path.extension().is_some_and(|e| e == "a") {
            return describe_archive(path);
        }
        describe_file(path)
    }

    fn pkg_config_resolves(
        &self,
        platform: &PlatformDescriptor,
        name: &str,
        env: &[(String, String)],
    ) -> Result<bool> {
        let mut cmd = Command::new(&platform.pkg_config);
        cmd.args(["--exists", name]);
        for (k, v) in env {
            cmd.env(k, v);
        }
        Ok(output_of(cmd, &platform.pkg_config)?.status.success())
    }

    fn linkage(&self, platform: &PlatformDescriptor, binary: &Path) -> Result<Linkage> {
        match platform.os.as_str() {
            "macos" => {
                let mut cmd = Command::new("otool");
                cmd.arg("-L").arg(binary);
                let out = output_of(cmd, "otool")?;
                Ok(Linkage {
                    interpreter: None,
                    needed: parse_otool_libs(&String::from_utf8_lossy(&out.stdout)),
                })
            }
            "windows" => {
                let objdump = platform.tool("objdump");
                let mut cmd = Command::new(&objdump);
                cmd.arg("-p").arg(binary);
                let out = output_of(cmd, &objdump)?;
                Ok(Linkage {
                    interpreter: None,
                    needed: parse_objdump_dlls(&String::from_utf8_lossy(&out.stdout)),
                })
            }
            _ => {
                let mut headers = Command::new("readelf");
                headers.arg("-lW").arg(binary);
                let headers = output_of(headers, "readelf")?;
                let mut dynamic = Command::new("readelf");
                dynamic.arg("-dW").arg(binary);
                let dynamic = output_of(dynamic, "readelf")?;
                Ok(Linkage {
                    interpreter: parse_readelf_interpreter(&String::from_utf8_lossy(
                        &headers.stdout,
                    )),
                    needed: parse_readelf_needed(&String::from_utf8_lossy(&dynamic.stdout)),
                })
            }
        }
    }
}

fn describe_file(path: &Path) -> Result<String> {
    let mut cmd = Command::new("file");
    cmd.arg("-b").arg(path);
    let out = output_of(cmd, "file")?;
    if !out.status.success() {
        return Err(Error::msg(format!(
            "file(1) failed on {}: {}",
            path.display(),
            stderr_line(&out)
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn describe_archive(path: &Path) -> Result<String> {
    let abs = path
        .canonicalize()
        .map_err(|e| Error::msg(format!("failed to resolve {}: {e}", path.display())))?;
    let scratch = tempfile::tempdir()
        .map_err(|e| Error::msg(format!("failed to create scratch dir: {e}")))?;
    let mut cmd = Command::new("ar");
    cmd.arg("x").arg(&abs).current_dir(scratch.path());
    let out = output_of(cmd, "ar")?;
    if !out.status.success() {
        return Err(Error::msg(format!(
            "ar x failed on {}: {}",
            path.display(),
            stderr_line(&out)
        )));
    }
    let mut members: Vec<PathBuf> = WalkDir::new(scratch.path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    members.sort();
    let Some(member) = members.first() else {
        return Ok("empty archive".into());
    };
    describe_file(member)
}

pub fn parse_readelf_interpreter(text: &str) -> Option<String> {
    const MARK: &str = "Requesting program interpreter:";
    let line = text.lines().find(|l| l.contains(MARK))?;
    let rest = line.split_once(MARK)?.1;
    Some(rest.trim().trim_end_matches(']').trim().to_string()).filter(|s| !s.is_empty())
}

pub fn parse_readelf_needed(text: &str) -> Vec<String> {
    text.lines()
        .filter(|l| l.contains("(NEEDED)"))
        .filter_map(|l| {
            let start = l.find('[')? + 1;
            let end = l[start..].find(']')? + start;
            Some(l[start..end].to_string())
        })
        .collect()
}

/// `otool -L` prints the binary path first, then one indented dependency per line.
pub fn parse_otool_libs(text: &str) -> Vec<String> {
    text.lines()
        .skip(1)
        .filter_map(|l| {
            let l = l.trim();
            let lib = l.split(" (compatibility").next()?.trim();
            (!lib.is_empty()).then(|| lib.to_string())
        })
        .collect()
}

pub fn parse_objdump_dlls(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|l| l.trim().strip_prefix("DLL Name:"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_readelf_program_headers() {
        let text = "\
Program Headers:
  Type           Offset   VirtAddr           PhysAddr
  INTERP         0x000318 0x0000000000000318 0x0000000000000318 0x00001c 0x00001c R   0x1
      [Requesting program interpreter: /lib64/ld-linux-x86-64.so.2]
";
        assert_eq!(
            parse_readelf_interpreter(text).as_deref(),
            Some("/lib64/ld-linux-x86-64.so.2")
        );
        assert_eq!(parse_readelf_interpreter("Program Headers:\n  LOAD ...\n"), None);
    }

    #[test]
    fn parses_readelf_dynamic_section() {
        let text = "\
Dynamic section at offset 0x2dc8 contains 27 entries:
  Tag        Type                         Name/Value
 0x0000000000000001 (NEEDED)             Shared library: [libm.so.6]
 0x0000000000000001 (NEEDED)             Shared library: [libc.so.6]
 0x000000000000000c (INIT)               0x1000
";
        assert_eq!(parse_readelf_needed(text), vec!["libm.so.6", "libc.so.6"]);
    }

    #[test]
    fn parses_otool_listing() {
        let text = "\
out/macos-arm64/free/bin/ffmpeg:
\t/usr/lib/libSystem.B.dylib (compatibility version 1.0.0, current version 1345.100.2)
\t/System/Library/Frameworks/CoreVideo.framework/Versions/A/CoreVideo (compatibility version 1.2.0, current version 1.5.0)
";
        assert_eq!(
            parse_otool_libs(text),
            vec![
                "/usr/lib/libSystem.B.dylib",
                "/System/Library/Frameworks/CoreVideo.framework/Versions/A/CoreVideo"
            ]
        );
    }

    #[test]
    fn parses_objdump_imports() {
        let text = "\tDLL Name: KERNEL32.dll\n\tvma:  Hint/Ord Member-Name\n\tDLL Name: msvcrt.dll\n";
        assert_eq!(parse_objdump_dlls(text), vec!["KERNEL32.dll", "msvcrt.dll"]);
    }

    #[test]
    fn splits_compiler_settings() {
        let (p, a) = split_command("clang --target=aarch64-linux-gnu").expect("split");
        assert_eq!(p, "clang");
        assert_eq!(a, vec!["--target=aarch64-linux-gnu"]);
        assert!(split_command("   ").is_none());
    }
}
