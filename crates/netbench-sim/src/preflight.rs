use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::cgroup::cgroup_v2_available;
use crate::command::is_root;

/// Locate `name` in `PATH`.
pub fn check_binary(name: &str) -> Option<PathBuf> {
    Command::new("sh")
        .args(["-c", &format!("command -v {name}")])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| PathBuf::from(String::from_utf8_lossy(&o.stdout).trim().to_string()))
}

/// True if privileged commands can run without prompting.
pub fn can_escalate() -> bool {
    is_root()
        || Command::new("sudo")
            .args(["-n", "true"])
            .stdin(Stdio::null())
            .output()
            .is_ok_and(|o| o.status.success())
}

/// First prerequisite found missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingPrerequisite {
    NotRoot,
    MissingTool(String),
    NoNetem,
    NoCgroupV2,
}

impl std::fmt::Display for MissingPrerequisite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissingPrerequisite::NotRoot => write!(f, "requires root / passwordless sudo"),
            MissingPrerequisite::MissingTool(t) => write!(f, "system tool '{t}' not found"),
            MissingPrerequisite::NoNetem => write!(
                f,
                "sch_netem kernel module not available (try: sudo modprobe sch_netem)"
            ),
            MissingPrerequisite::NoCgroupV2 => {
                write!(f, "cgroup v2 hierarchy not mounted at /sys/fs/cgroup")
            }
        }
    }
}

impl std::error::Error for MissingPrerequisite {}

/// Check the tools and privileges an emulation run needs.
pub fn check_prerequisites(tools: &[&str]) -> Result<(), MissingPrerequisite> {
    for tool in tools {
        if check_binary(tool).is_none() {
            return Err(MissingPrerequisite::MissingTool(tool.to_string()));
        }
    }
    if !can_escalate() {
        return Err(MissingPrerequisite::NotRoot);
    }
    Ok(())
}

/// Everything [`check_prerequisites`] checks, plus netem and cgroup v2.
pub fn check_emulation_deps() -> Result<(), MissingPrerequisite> {
    check_prerequisites(&["ip", "tc"])?;

    let netem = crate::command::run("modprobe", &["sch_netem"]).is_ok_and(|o| o.status.success());
    if !netem {
        return Err(MissingPrerequisite::NoNetem);
    }

    if !cgroup_v2_available() {
        return Err(MissingPrerequisite::NoCgroupV2);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_sh() {
        assert!(check_binary("sh").is_some());
    }

    #[test]
    fn missing_tool_reported_first() {
        let err = check_prerequisites(&["definitely-not-a-real-tool-xyz"]).unwrap_err();
        assert_eq!(
            err,
            MissingPrerequisite::MissingTool("definitely-not-a-real-tool-xyz".into())
        );
        assert!(err.to_string().contains("definitely-not-a-real-tool-xyz"));
    }
}
