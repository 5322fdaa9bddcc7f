use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::preflight::can_escalate;

static NS_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns `true` if the environment supports namespace-based tests
/// (requires the `ip` tool and root or passwordless `sudo`).
pub fn check_privileges() -> bool {
    let has_ip = Command::new("ip")
        .arg("netns")
        .output()
        .is_ok_and(|o| o.status.success());

    has_ip && can_escalate()
}

/// Generate a unique namespace/cgroup name safe for parallel tests.
///
/// Combines prefix + PID + atomic counter, truncated to 15 chars.
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = NS_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xffff;
    let name = format!("{prefix}_{pid:x}_{seq}");
    if name.len() > 15 {
        name[..15].to_string()
    } else {
        name
    }
}

/// True once `pid` has exited, waiting up to two seconds. A zombie
/// waiting for its reaper counts as exited.
pub fn process_gone(pid: u32) -> bool {
    let stat = format!("/proc/{pid}/stat");
    for _ in 0..40 {
        match std::fs::read_to_string(&stat) {
            Err(_) => return true,
            // State is the first field after the parenthesised comm.
            Ok(s) if s.rsplit(')').next().is_some_and(|r| r.trim_start().starts_with('Z')) => {
                return true
            }
            Ok(_) => std::thread::sleep(Duration::from_millis(50)),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_short() {
        let a = unique_ns_name("prefix_that_is_long");
        let b = unique_ns_name("nb");
        let c = unique_ns_name("nb");
        assert!(a.len() <= 15);
        assert_ne!(b, c);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(!process_gone(std::process::id()));
    }

    #[test]
    fn reaped_child_is_gone() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(process_gone(pid));
    }
}
