use std::fs;
use std::path::Path;

use crate::adapter::BuildRequest;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::platform::PlatformDescriptor;
use crate::toolchain::split_command;

/// Cross-compilation block written to `toolchain.cmake` when the platform has a cross prefix.
pub fn toolchain_file(platform: &PlatformDescriptor, sysroot_prefix: &Path) -> String {
    let compiler = |raw: &str| -> (String, String) {
        match split_command(raw) {
            Some((program, args)) => (program, args.join(" ")),
            None => (raw.to_string(), String::new()),
        }
    };
    let (cc, cc_args) = compiler(&platform.cc);
    let (cxx, cxx_args) = compiler(&platform.cxx);

    let mut out = String::new();
    out.push_str(&format!("set(CMAKE_SYSTEM_NAME {})\n", platform.cmake_system_name()));
    out.push_str(&format!("set(CMAKE_SYSTEM_PROCESSOR {})\n", platform.arch));
    out.push_str(&format!("set(CMAKE_C_COMPILER {cc})\n"));
    out.push_str(&format!("set(CMAKE_CXX_COMPILER {cxx})\n"));
    if !cc_args.is_empty() {
        out.push_str(&format!("set(CMAKE_C_COMPILER_ARG1 \"{cc_args}\")\n"));
    }
    if !cxx_args.is_empty() {
        out.push_str(&format!("set(CMAKE_CXX_COMPILER_ARG1 \"{cxx_args}\")\n"));
    }
    out.push_str(&format!("set(CMAKE_AR {})\n", platform.tool("ar")));
    out.push_str(&format!("set(CMAKE_RANLIB {})\n", platform.tool("ranlib")));
    if platform.os == "windows" {
        out.push_str(&format!("set(CMAKE_RC_COMPILER {})\n", platform.tool("windres")));
    }
    out.push_str(&format!("set(CMAKE_FIND_ROOT_PATH {})\n", sysroot_prefix.display()));
    out.push_str("set(CMAKE_FIND_ROOT_PATH_MODE_PROGRAM NEVER)\n");
    out.push_str("set(CMAKE_FIND_ROOT_PATH_MODE_LIBRARY ONLY)\n");
    out.push_str("set(CMAKE_FIND_ROOT_PATH_MODE_INCLUDE ONLY)\n");
    out.push_str("set(CMAKE_FIND_ROOT_PATH_MODE_PACKAGE ONLY)\n");
    out
}

pub fn configure_args(req: &BuildRequest<'_>, toolchain: Option<&Path>) -> Vec<String> {
    let build_type = if req.debug { "Debug" } else { "Release" };
    let mut args = vec![
        format!("-DCMAKE_INSTALL_PREFIX={}", req.prefix.root.display()),
        "-DBUILD_SHARED_LIBS=OFF".to_string(),
        "-DCMAKE_INSTALL_LIBDIR=lib".to_string(),
        format!("-DCMAKE_BUILD_TYPE={build_type}"),
        "-DCMAKE_POSITION_INDEPENDENT_CODE=ON".to_string(),
        format!("-DCMAKE_PREFIX_PATH={}", req.prefix.root.display()),
    ];
    if let Some(path) = toolchain {
        args.push(format!("-DCMAKE_TOOLCHAIN_FILE={}", path.display()));
    }
    args.extend(req.target.dependency.configure_args.iter().map(|s| s.to_string()));
    args
}

pub fn build(req: &BuildRequest<'_>, src: &Path, ctx: &ExecCtx) -> Result<()> {
    let build_dir = req.build_dir();
    fs::create_dir_all(&build_dir)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", build_dir.display())))?;

    let toolchain = if req.platform.is_cross() {
        let path = build_dir.join("toolchain.cmake");
        fs::write(&path, toolchain_file(req.platform, &req.prefix.root))
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
        Some(path)
    } else {
        None
    };

    let mut configure = req.command("cmake", &build_dir);
    configure
        .arg("-S")
        .arg(src)
        .arg("-B")
        .arg(&build_dir)
        .args(configure_args(req, toolchain.as_deref()));
    ctx.run_cmd(configure)?;

    let mut compile = req.command("cmake", &build_dir);
    compile
        .arg("--build")
        .arg(&build_dir)
        .arg("--parallel")
        .arg(req.jobs.max(1).to_string());
    ctx.run_cmd(compile)?;

    let mut install = req.command("cmake", &build_dir);
    install.arg("--install").arg(&build_dir);
    ctx.run_cmd(install)
}
