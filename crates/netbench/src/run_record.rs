//! Per-run log files.
//!
//! Every run writes `server_<ts><ext>` and `client_<ts><ext>` into one log
//! directory; the shared integer timestamp ties the pair together for
//! offline analysis.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NetbenchError, Result};
use crate::topology::HostRole;

/// Where run logs go and how they are named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogLayout {
    pub dir: PathBuf,
    pub extension: String,
}

impl Default for LogLayout {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".mnlog"),
            extension: ".mnlog".into(),
        }
    }
}

impl LogLayout {
    /// Create the log directory if absent and return its absolute path.
    ///
    /// Commands run with the same working directory as this process, but
    /// the absolute form keeps the banner and run report unambiguous.
    pub fn ensure_dir(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))
            .map_err(|e| NetbenchError::resource("log directory", e))?;
        let abs = std::fs::canonicalize(&self.dir)
            .with_context(|| format!("resolve {}", self.dir.display()))
            .map_err(|e| NetbenchError::resource("log directory", e))?;
        debug!(dir = %abs.display(), "log directory ready");
        Ok(abs)
    }

    pub fn file_name(&self, role: HostRole, timestamp: i64) -> String {
        format!("{role}_{timestamp}{}", self.extension)
    }
}

/// The two log files and commands of one run. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub timestamp: i64,
    pub server_log: PathBuf,
    pub client_log: PathBuf,
    pub server_command: String,
    pub client_command: String,
}

impl RunRecord {
    pub fn new(
        dir: &Path,
        layout: &LogLayout,
        timestamp: i64,
        server_command: &str,
        client_command: &str,
    ) -> Self {
        Self {
            timestamp,
            server_log: dir.join(layout.file_name(HostRole::Server, timestamp)),
            client_log: dir.join(layout.file_name(HostRole::Client, timestamp)),
            server_command: server_command.to_string(),
            client_command: client_command.to_string(),
        }
    }

    pub fn log_path(&self, role: HostRole) -> &Path {
        match role {
            HostRole::Server => &self.server_log,
            HostRole::Client => &self.client_log,
        }
    }

    pub fn command(&self, role: HostRole) -> &str {
        match role {
            HostRole::Server => &self.server_command,
            HostRole::Client => &self.client_command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_share_timestamp() {
        let layout = LogLayout::default();
        let rec = RunRecord::new(Path::new("/logs"), &layout, 1_700_000_000, "srv", "cli");
        assert_eq!(rec.server_log, Path::new("/logs/server_1700000000.mnlog"));
        assert_eq!(rec.client_log, Path::new("/logs/client_1700000000.mnlog"));
        assert_eq!(rec.command(HostRole::Server), "srv");
        assert_eq!(rec.log_path(HostRole::Client), rec.client_log.as_path());
    }

    #[test]
    fn custom_extension() {
        let layout = LogLayout {
            dir: PathBuf::from("out"),
            extension: ".log".into(),
        };
        assert_eq!(layout.file_name(HostRole::Client, 42), "client_42.log");
    }

    #[test]
    fn ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = LogLayout {
            dir: tmp.path().join("a/b"),
            ..Default::default()
        };
        let abs = layout.ensure_dir().unwrap();
        assert!(abs.is_dir());
        assert!(abs.is_absolute());
        // Second call is a no-op.
        assert_eq!(layout.ensure_dir().unwrap(), abs);
    }
}
