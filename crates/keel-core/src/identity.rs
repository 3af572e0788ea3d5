//! Stable worker identity derived from the deployment environment.
//!
//! Every worker process computes one identity at startup and uses it for the
//! lifetime of the process. The identity is the ownership token recorded on
//! every task the worker acquires, so it must be:
//!
//! - **Stable**: the same for the whole process lifetime
//! - **Unique**: no two live processes may share one
//! - **Legible**: operators can map it back to a node and pod

use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Environment variable naming the node hosting this worker.
pub const NODE_NAME_VAR: &str = "NODE_NAME";
/// Environment variable naming the pod hosting this worker.
pub const POD_NAME_VAR: &str = "POD_NAME";
/// Environment variable carrying a pre-assigned instance id.
pub const INSTANCE_ID_VAR: &str = "INSTANCE_ID";

const UNKNOWN_NODE: &str = "unknown-node";
const UNKNOWN_POD: &str = "unknown-pod";

/// Identity of a single worker process.
///
/// Rendered as `{node}-{pod}-{instance}`; the rendered form is what the
/// ledger stores in `workerPodId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerIdentity {
    /// Node hosting the worker.
    pub node_name: String,
    /// Pod (deployment unit) hosting the worker.
    pub pod_name: String,
    /// Unique instance discriminator within the pod.
    pub instance_id: String,
}

impl WorkerIdentity {
    /// Creates an identity from explicit parts.
    #[must_use]
    pub fn new(
        node_name: impl Into<String>,
        pod_name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            pod_name: pod_name.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Derives the identity from the environment.
    ///
    /// Reads `NODE_NAME`, `POD_NAME`, and `INSTANCE_ID`. Missing values are
    /// substituted with `"unknown-node"`, `"unknown-pod"`, and a fresh UUID
    /// respectively, so a worker always has a usable identity.
    #[must_use]
    pub fn from_env() -> Self {
        let node_name = non_empty_env(NODE_NAME_VAR).unwrap_or_else(|| UNKNOWN_NODE.to_string());
        let pod_name = non_empty_env(POD_NAME_VAR).unwrap_or_else(|| UNKNOWN_POD.to_string());
        let instance_id =
            non_empty_env(INSTANCE_ID_VAR).unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            node_name,
            pod_name,
            instance_id,
        }
    }

    /// Returns the rendered worker id, `{node}-{pod}-{instance}`.
    #[must_use]
    pub fn worker_id(&self) -> String {
        format!("{}-{}-{}", self.node_name, self.pod_name, self.instance_id)
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.node_name, self.pod_name, self.instance_id
        )
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}
