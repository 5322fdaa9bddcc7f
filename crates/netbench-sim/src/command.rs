use std::io::Write;
use std::process::{Command, Output, Stdio};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// True when this process already has an effective uid of 0.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and always succeeds.
    unsafe { libc::geteuid() == 0 }
}

/// Build a command running `program args...` with root privileges.
///
/// Goes through `sudo` unless the caller is already root, so the same code
/// path works inside containers that ship without sudo.
pub fn privileged(program: &str, args: &[&str]) -> Command {
    let mut cmd = if is_root() {
        Command::new(program)
    } else {
        let mut cmd = Command::new("sudo");
        cmd.arg(program);
        cmd
    };
    cmd.args(args);
    cmd
}

/// Run a privileged command, returning raw output.
pub fn run(program: &str, args: &[&str]) -> Result<Output> {
    debug!(cmd = %format!("{program} {}", args.join(" ")), "exec");
    privileged(program, args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("{program} {}", args.join(" ")))
}

/// Run a privileged command, bailing with its stderr if it exits non-zero.
pub fn run_checked(program: &str, args: &[&str]) -> Result<Output> {
    let output = run(program, args)?;
    if !output.status.success() {
        bail!(
            "command failed: {program} {}\n{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Write `contents` to a root-owned file (cgroup control files, mostly).
pub fn write_file(path: &str, contents: &str) -> Result<()> {
    debug!(path, contents, "privileged write");
    let mut child = privileged("tee", &[path])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn tee {path}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(contents.as_bytes())
            .with_context(|| format!("write {path}"))?;
    }

    let output = child.wait_with_output().context("wait for tee")?;
    if !output.status.success() {
        bail!(
            "write {path} failed\n{}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Quote `s` for safe interpolation into a POSIX shell script.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_plain() {
        assert_eq!(shell_quote("/tmp/a b.log"), "'/tmp/a b.log'");
    }

    #[test]
    fn shell_quote_embedded_quote() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn shell_quote_roundtrips_through_sh() {
        let tricky = "a'b\"c $HOME `x`";
        let out = Command::new("sh")
            .args(["-c", &format!("printf %s {}", shell_quote(tricky))])
            .output()
            .expect("run sh");
        assert_eq!(String::from_utf8_lossy(&out.stdout), tricky);
    }
}
