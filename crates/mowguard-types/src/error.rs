use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Global error type spanning sensor ingest, interlock rejections, watchdog
/// faults and the control surface.
///
/// Every variant carries a machine-readable [`reason`](MowError::reason) and
/// a [`remediation`](MowError::remediation) hint so the control surface can
/// tell callers what to do next.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MowError {
    #[error("Invalid reading from {source_id}: {reason}")]
    InvalidReading { source_id: String, reason: String },

    #[error("Transient read error on {topic}: {details}")]
    TransientRead { topic: String, details: String },

    #[error("Interlock violation: blocked by {}", .blocking.join(", "))]
    InterlockViolation { blocking: Vec<String> },

    #[error("Watchdog timeout on {component}")]
    WatchdogTimeout { component: String },

    #[error("Emergency clear requires confirmation")]
    ConfirmationRequired,

    #[error("Interlock still active: {}", .names.join(", "))]
    InterlockStillActive { names: Vec<String> },

    #[error("Bridge session {session} fault: {details}")]
    BridgeSessionFault { session: String, details: String },

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl MowError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            MowError::InvalidReading { .. } => "invalid_reading",
            MowError::TransientRead { .. } => "transient_read_error",
            MowError::InterlockViolation { .. } => "interlock_violation",
            MowError::WatchdogTimeout { .. } => "watchdog_timeout",
            MowError::ConfirmationRequired => "confirmation_required",
            MowError::InterlockStillActive { .. } => "interlock_still_active",
            MowError::BridgeSessionFault { .. } => "bridge_session_fault",
            MowError::InvalidTopic { .. } => "invalid_topic",
            MowError::Channel(_) => "channel_error",
            MowError::Config(_) => "config_error",
            MowError::Serialization(_) => "serialization_error",
            MowError::Storage(_) => "storage_error",
        }
    }

    /// Hint for the caller on how to recover.
    pub fn remediation(&self) -> &'static str {
        match self {
            MowError::InvalidReading { .. } => {
                "check the producer payload shape and clock; the reading was not published"
            }
            MowError::TransientRead { .. } => {
                "the last known value is served with decayed quality; check the sensor link"
            }
            MowError::InterlockViolation { .. } => {
                "resolve the blocking interlocks listed in `blocking` and retry"
            }
            MowError::WatchdogTimeout { .. } => {
                "restore the silent component, then issue an emergency clear with confirmation"
            }
            MowError::ConfirmationRequired => "resend the clear request with {\"confirmation\": true}",
            MowError::InterlockStillActive { .. } => {
                "remediate the listed interlocks on the machine before clearing again"
            }
            MowError::BridgeSessionFault { .. } => "reconnect the observer session",
            MowError::InvalidTopic { .. } => {
                "use a lowercase slash-separated topic such as sensors/<class>/<id>"
            }
            MowError::Channel(_) => "the target component is shutting down; retry later",
            MowError::Config(_) => "fix the configuration file or MOWGUARD_* overrides",
            MowError::Serialization(_) => "send well-formed JSON",
            MowError::Storage(_) => "check the journal database path and permissions",
        }
    }

    /// Names of the interlocks involved, if any.
    pub fn blocking(&self) -> &[String] {
        match self {
            MowError::InterlockViolation { blocking } => blocking,
            MowError::InterlockStillActive { names } => names,
            _ => &[],
        }
    }
}
