use std::path::Path;

use crate::adapter::BuildRequest;
use crate::error::Result;
use crate::executor::ExecCtx;

pub fn configure_args(req: &BuildRequest<'_>) -> Vec<String> {
    let mut args = vec![
        format!("--prefix={}", req.prefix.root.display()),
        "--enable-static".to_string(),
        "--disable-shared".to_string(),
    ];
    if let Some(host) = req.platform.host_triple()
        && (req.platform.is_cross() || req.platform.host_triple.is_some())
    {
        args.push(format!("--host={host}"));
    }
    args.extend(req.target.dependency.configure_args.iter().map(|s| s.to_string()));
    args
}

/// configure, make, make install; in-tree, since several upstreams reject out-of-tree builds.
pub fn build(req: &BuildRequest<'_>, src: &Path, ctx: &ExecCtx) -> Result<()> {
    let configure = src.join("configure");
    if !configure.is_file() {
        for script in ["autogen.sh", "bootstrap"] {
            if src.join(script).is_file() {
                let mut cmd = req.command("sh", src);
                cmd.arg(script);
                ctx.run_cmd(cmd)?;
                break;
            }
        }
    }

    let mut cmd = req.command(&configure, src);
    cmd.args(configure_args(req));
    ctx.run_cmd(cmd)?;

    let mut make = req.command("make", src);
    make.arg(format!("-j{}", req.jobs.max(1)));
    ctx.run_cmd(make)?;

    let mut install = req.command("make", src);
    install.arg("install");
    ctx.run_cmd(install)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::{prefix, target};
    use crate::platform::PlatformCatalog;

    #[test]
    fn cross_builds_pass_host_and_static_flags() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let prefix = prefix(tmp.path());
        let cat = PlatformCatalog::builtin();
        let t = target("x264");

        let cross = BuildRequest {
            target: &t,
            platform: cat.get("linux-aarch64-gnu").expect("platform"),
            prefix: &prefix,
            debug: false,
            jobs: 4,
        };
        let args = configure_args(&cross);
        assert_eq!(args[0], format!("--prefix={}", prefix.root.display()));
        assert!(args.contains(&"--enable-static".to_string()));
        assert!(args.contains(&"--disable-shared".to_string()));
        assert!(args.contains(&"--host=aarch64-linux-gnu".to_string()));
        assert!(args.ends_with(&["--disable-cli".to_string(), "--enable-pic".to_string()]));

        let native = BuildRequest {
            platform: cat.get("linux-x86_64-gnu").expect("platform"),
            ..cross
        };
        assert!(!configure_args(&native).iter().any(|a| a.starts_with("--host=")));
    }
}
