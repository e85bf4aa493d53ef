use std::fs;
use std::path::Path;

use crate::adapter::BuildRequest;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::platform::PlatformDescriptor;
use crate::toolchain::split_command;

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn array(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| quote(s)).collect();
    format!("[{}]", quoted.join(", "))
}

fn command_array(raw: &str) -> String {
    match split_command(raw) {
        Some((program, mut args)) => {
            args.insert(0, program);
            array(&args)
        }
        None => array(&[raw.to_string()]),
    }
}

/// Meson cross file for `platform`.
pub fn cross_file(platform: &PlatformDescriptor, cflags: &[String]) -> String {
    let mut out = String::from("[binaries]\n");
    out.push_str(&format!("c = {}\n", command_array(&platform.cc)));
    out.push_str(&format!("cpp = {}\n", command_array(&platform.cxx)));
    out.push_str(&format!("ar = {}\n", quote(&platform.tool("ar"))));
    out.push_str(&format!("strip = {}\n", quote(&platform.tool("strip"))));
    out.push_str(&format!("pkg-config = {}\n", quote(&platform.pkg_config)));
    if platform.os == "windows" {
        out.push_str(&format!("windres = {}\n", quote(&platform.tool("windres"))));
    }

    out.push_str("\n[built-in options]\n");
    out.push_str(&format!("c_args = {}\n", array(cflags)));
    out.push_str(&format!("cpp_args = {}\n", array(cflags)));
    out.push_str(&format!("c_link_args = {}\n", array(&platform.ldflags)));
    out.push_str(&format!("cpp_link_args = {}\n", array(&platform.ldflags)));

    out.push_str("\n[host_machine]\n");
    out.push_str(&format!("system = {}\n", quote(platform.meson_system())));
    out.push_str(&format!("cpu_family = {}\n", quote(platform.meson_cpu_family())));
    out.push_str(&format!("cpu = {}\n", quote(&platform.arch)));
    out.push_str("endian = 'little'\n");
    out
}

pub fn setup_args(req: &BuildRequest<'_>, cross: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        format!("--prefix={}", req.prefix.root.display()),
        "--libdir=lib".to_string(),
        "--default-library=static".to_string(),
        format!("--buildtype={}", req.build_type()),
    ];
    if let Some(path) = cross {
        args.push(format!("--cross-file={}", path.display()));
    }
    args.extend(req.target.dependency.configure_args.iter().map(|s| s.to_string()));
    args
}

pub fn build(req: &BuildRequest<'_>, src: &Path, ctx: &ExecCtx) -> Result<()> {
    let build_dir = req.build_dir();
    let parent = build_dir.parent().unwrap_or(build_dir.as_path());
    fs::create_dir_all(parent)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    // A previous failed setup leaves a directory meson refuses to reuse.
    if build_dir.exists() && !build_dir.join("build.ninja").is_file() {
        fs::remove_dir_all(&build_dir)
            .map_err(|e| Error::msg(format!("failed to remove {}: {e}", build_dir.display())))?;
    }

    let cross = if req.platform.is_cross() {
        let path = parent.join(format!("{}.cross.ini", req.target.name()));
        fs::write(&path, cross_file(req.platform, &req.cflags()))
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
        Some(path)
    } else {
        None
    };

    let mut setup = req.command("meson", src);
    setup
        .arg("setup")
        .arg(&build_dir)
        .arg(src)
        .args(setup_args(req, cross.as_deref()));
    if build_dir.join("build.ninja").is_file() {
        setup.arg("--reconfigure");
    }
    ctx.run_cmd(setup)?;

    let mut compile = req.command("meson", src);
    compile
        .arg("compile")
        .arg("-C")
        .arg(&build_dir)
        .arg("-j")
        .arg(req.jobs.max(1).to_string());
    ctx.run_cmd(compile)?;

    let mut install = req.command("meson", src);
    install.arg("install").arg("-C").arg(&build_dir);
    ctx.run_cmd(install)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformCatalog;

    #[test]
    fn cross_file_describes_host_machine() {
        let cat = PlatformCatalog::builtin();
        let p = cat.get("linux-armv7-gnu").expect("platform");
        let text = cross_file(p, &p.cflags);
        assert!(text.contains("c = ['arm-linux-gnueabihf-gcc']"));
        assert!(text.contains("ar = 'arm-linux-gnueabihf-ar'"));
        assert!(text.contains("cpu_family = 'arm'"));
        assert!(text.contains("cpu = 'armv7'"));
        assert!(text.contains("system = 'linux'"));
        assert!(text.contains("'-mfloat-abi=hard'"));
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(quote("it's"), "'it\\'s'");
        assert_eq!(command_array("ccache gcc"), "['ccache', 'gcc']");
    }
}
