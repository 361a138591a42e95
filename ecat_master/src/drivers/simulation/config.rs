//! Simulation driver configuration.

use serde::{Deserialize, Serialize};

/// Bring-up or request step that can be forced to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPoint {
    RequestMaster,
    SlaveConfig,
    SyncManager,
    PdoAssignAdd,
    PdoMappingAdd,
    ConfigSdo,
    CreateDomain,
    RegisterEntries,
    Activate,
    CreateRequest,
}

/// How submitted object requests evolve while being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestBehaviour {
    /// Complete after the given number of state polls.
    Complete { after_polls: u32 },
    /// Fall back to `Unused` once, then complete after the given polls.
    DropFirst { after_polls: u32 },
    /// Stay busy forever.
    Hang,
    /// Report an error on the first poll.
    Fail,
}

impl Default for RequestBehaviour {
    fn default() -> Self {
        Self::Complete { after_polls: 2 }
    }
}

/// Object address `(position, index, subindex)`.
pub type ObjectAddress = (u16, u16, u8);

/// Output → input loopback: every receive copies the output's bits into
/// the input, truncated to the input width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoLink {
    pub output: ObjectAddress,
    pub input: ObjectAddress,
}

/// Simulation driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Receive cycles after activation before devices report OP.
    pub activation_cycles: u32,
    /// Output → input loopbacks.
    pub echo: Vec<EchoLink>,
    /// Initial object request behaviour.
    pub requests: RequestBehaviour,
    /// Step forced to fail.
    pub fail_at: Option<FailPoint>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            activation_cycles: 3,
            echo: Vec::new(),
            requests: RequestBehaviour::default(),
            fail_at: None,
        }
    }
}
