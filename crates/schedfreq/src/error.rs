use derive_more::Display;

/// Error type shared by the governor front object and its components.
#[derive(Debug, Display)]
pub enum GovernorError {
    /// Domain or governor configuration is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    /// A tunable store received a value it cannot accept.
    #[display("invalid tunable value: {reason}")]
    InvalidTunable { reason: String },
    /// A domain with this id is already active.
    #[display("domain {id} is already active")]
    DomainActive { id: u32 },
    /// No active domain with this id.
    #[display("no active domain {id}")]
    UnknownDomain { id: u32 },
    /// A CPU in the requested domain is owned by another active domain.
    #[display("cpu {cpu} is already claimed by an active domain")]
    CpuClaimed { cpu: usize },
    /// A CPU index lies outside the governor's configured CPU range.
    #[display("cpu {cpu} is out of range for this governor")]
    CpuOutOfRange { cpu: usize },
    /// The slow-path worker thread could not be spawned.
    #[display("failed to spawn slow-path worker: {reason}")]
    WorkerSpawn { reason: String },
    /// The actuator refused to apply a target frequency.
    #[display("actuator rejected target {freq_khz} kHz")]
    ActuationRejected { freq_khz: u32 },
}

impl core::error::Error for GovernorError {}

impl GovernorError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn invalid_tunable(reason: impl Into<String>) -> Self {
        Self::InvalidTunable {
            reason: reason.into(),
        }
    }
}
