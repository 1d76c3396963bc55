use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Missing or invalid setting, unsafe file provenance, digest mismatch.
    Configuration,
    /// Observed height already past the target.
    SafetyAbort,
    /// A step of the upgrade sequence failed.
    Sequence,
    /// SIGINT/SIGTERM received while waiting or mid-sequence.
    Interrupted,
}

impl FailureKind {
    pub fn exit_code(self) -> u8 {
        match self {
            FailureKind::Configuration => 2,
            FailureKind::SafetyAbort => 3,
            FailureKind::Sequence => 4,
            FailureKind::Interrupted => 130,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration",
            FailureKind::SafetyAbort => "safety_abort",
            FailureKind::Sequence => "sequence",
            FailureKind::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpgradeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl UpgradeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Configuration, message)
    }

    pub fn safety_abort(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SafetyAbort, message)
    }

    pub fn sequence(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Sequence, message)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Interrupted, message)
    }

    /// Folds an `anyhow` chain into a configuration failure, keeping every context layer.
    pub fn from_config_error(err: anyhow::Error) -> Self {
        Self::configuration(format!("{:#}", err))
    }

    pub fn exit_code(&self) -> u8 {
        self.kind.exit_code()
    }
}

impl Display for UpgradeFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for UpgradeFailure {}
