//! VM lifecycle status and its delivery to the client that asked for it.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::clients::Client;

const UNKNOWN_ERROR: &str = "Unknown Error";
const ERRORED_PREFIX: &str = "Errored: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    Launching,
    Running,
    Errored(String),
    Exited,
}

impl VmStatus {
    /// Build an `Errored` status, substituting a generic message for an empty one.
    pub fn errored(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim().is_empty() {
            VmStatus::Errored(UNKNOWN_ERROR.into())
        } else {
            VmStatus::Errored(message)
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmStatus::Launching => f.write_str("Launching"),
            VmStatus::Running => f.write_str("Running"),
            VmStatus::Errored(message) => write!(f, "{ERRORED_PREFIX}{message}"),
            VmStatus::Exited => f.write_str("Exited"),
        }
    }
}

impl FromStr for VmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Launching" => Ok(VmStatus::Launching),
            "Running" => Ok(VmStatus::Running),
            "Exited" => Ok(VmStatus::Exited),
            other => other
                .strip_prefix(ERRORED_PREFIX)
                .map(|message| VmStatus::Errored(message.to_string()))
                .ok_or_else(|| format!("unknown vm status '{other}'")),
        }
    }
}

/// Wire form of a status broadcast: `{"type":"status","status":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

impl StatusMessage {
    pub fn new(status: &VmStatus) -> Self {
        Self {
            kind: "status".into(),
            status: status.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"status","status":{:?}}}"#, self.status)
        })
    }

    pub fn vm_status(&self) -> Option<VmStatus> {
        self.status.parse().ok()
    }
}

/// Status sink for one launch.
///
/// After `Launching`, exactly one of `Running` or `Errored` is delivered; later
/// attempts are dropped and reported back as `false`.
pub struct StatusReporter {
    client: Client,
    launch_id: u64,
    settled: AtomicBool,
}

impl StatusReporter {
    pub fn new(client: Client, launch_id: u64) -> Self {
        Self {
            client,
            launch_id,
            settled: AtomicBool::new(false),
        }
    }

    pub fn launch_id(&self) -> u64 {
        self.launch_id
    }

    pub fn launching(&self) {
        self.client.post_status(&VmStatus::Launching);
    }

    pub fn running(&self) -> bool {
        self.settle(VmStatus::Running)
    }

    pub fn errored(&self, message: impl Into<String>) -> bool {
        self.settle(VmStatus::errored(message))
    }

    fn settle(&self, status: VmStatus) -> bool {
        if self
            .settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(
                launch = self.launch_id,
                "launch already settled; not sending '{status}'"
            );
            return false;
        }
        self.client.post_status(&status);
        true
    }
}
