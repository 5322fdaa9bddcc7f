//! Failure taxonomy of an emulation run.
//!
//! Only configuration and resource problems are errors. A host command that
//! exits non-zero is a [`CommandOutcome`](crate::controller::CommandOutcome),
//! observed in the logs but never failing the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetbenchError {
    /// Bandwidth string with neither one nor two `/`-separated integers.
    #[error("{value} is the wrong bandwidth parameter: expected <mbps> or <uplink>/<downlink>")]
    InvalidBandwidth { value: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Virtual network, host, link, cgroup or log allocation failure.
    #[error("{context}: {source:#}")]
    Resource {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("emulated network is not running")]
    NotRunning,
}

impl NetbenchError {
    pub fn resource(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        NetbenchError::Resource {
            context: context.into(),
            source: source.into(),
        }
    }

    /// True for errors raised before any virtual resource is allocated.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            NetbenchError::InvalidBandwidth { .. } | NetbenchError::Configuration(_)
        )
    }
}

pub type Result<T, E = NetbenchError> = std::result::Result<T, E>;
