use thiserror::Error;

/// Failures surfaced by control operations on the supervisor.
///
/// Timeouts during a graceful stop, failed process scans and a missing live
/// log are not represented here: they degrade (escalate, stay OFFLINE, keep
/// the current status) and are reported through `tracing` instead.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch {instance}: {reason}")]
    Launch { instance: String, reason: String },

    #[error("{instance} has no interactive channel (re-attached process without owned stdin)")]
    NoInteractiveChannel { instance: String },

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid instance config: {0}")]
    InvalidConfig(String),

    #[error("could not find a free port (requested {requested})")]
    PortUnavailable { requested: u16 },

    #[error("{instance} is not online")]
    NotOnline { instance: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Stable machine-readable code for callers that map errors onto an API.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Launch { .. } => "spawn_failed",
            SupervisorError::NoInteractiveChannel { .. } => "no_interactive_channel",
            SupervisorError::UnknownInstance(_) => "not_found",
            SupervisorError::AlreadyExists(_) => "already_exists",
            SupervisorError::InvalidConfig(_) => "invalid_param",
            SupervisorError::PortUnavailable { .. } => "port_unavailable",
            SupervisorError::NotOnline { .. } => "not_online",
            SupervisorError::Io(_) => "io",
            SupervisorError::Other(_) => "internal",
        }
    }

    pub(crate) fn launch(instance: &str, reason: impl Into<String>) -> Self {
        SupervisorError::Launch {
            instance: instance.to_string(),
            reason: reason.into(),
        }
    }
}

/// Joins an anyhow chain into one line, skipping repeated messages.
pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
