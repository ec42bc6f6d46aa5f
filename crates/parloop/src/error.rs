use thiserror::Error;

/// Failure classes surfaced by the offload pipeline.
///
/// Analysis and compilation failures are sticky for a call-site (the guard
/// stops trying to offload); runtime violations are absorbed by rollback and
/// baseline re-execution, so embedders only ever observe a correct result or
/// an error the sequential semantics would also have produced.
#[derive(Debug, Error)]
pub enum OffloadError {
    /// The program uses a construct the pipeline cannot express on a device.
    #[error("unsupported construct in '{site}': {reason}")]
    UnsupportedConstruct { site: String, reason: String },

    /// Parallel execution would reorder a data dependence.
    #[error("loop-carried dependence on '{variable}': {reason}")]
    DependenceViolation { variable: String, reason: String },

    /// An array access left its extent, either proven statically or
    /// observed through the runtime flag.
    #[error("array bound violation on '{array}': {detail}")]
    BoundViolation { array: String, detail: String },

    /// Integer arithmetic left the representable range of its type, or an
    /// integer division by zero was observed.
    #[error("arithmetic violation: {detail}")]
    OverflowViolation { detail: String },

    /// Kernel source generation or device compilation failed.
    #[error("kernel compilation failed: {detail}")]
    CompilationFailure { detail: String },

    /// The working set cannot fit the device memory budget.
    #[error("{detail}")]
    CapacityFailure { detail: String },

    /// The platform driver rejected an operation at runtime.
    #[error("device failure: {detail}")]
    DeviceFailure { detail: String },
}

impl OffloadError {
    pub fn unsupported(site: impl Into<String>, reason: impl Into<String>) -> Self {
        OffloadError::UnsupportedConstruct {
            site: site.into(),
            reason: reason.into(),
        }
    }

    pub fn dependence(variable: impl Into<String>, reason: impl Into<String>) -> Self {
        OffloadError::DependenceViolation {
            variable: variable.into(),
            reason: reason.into(),
        }
    }

    pub fn bound(array: impl Into<String>, detail: impl Into<String>) -> Self {
        OffloadError::BoundViolation {
            array: array.into(),
            detail: detail.into(),
        }
    }

    pub fn overflow(detail: impl Into<String>) -> Self {
        OffloadError::OverflowViolation {
            detail: detail.into(),
        }
    }

    pub fn compilation(detail: impl Into<String>) -> Self {
        OffloadError::CompilationFailure {
            detail: detail.into(),
        }
    }

    pub fn capacity(detail: impl Into<String>) -> Self {
        OffloadError::CapacityFailure {
            detail: detail.into(),
        }
    }

    pub fn device(detail: impl Into<String>) -> Self {
        OffloadError::DeviceFailure {
            detail: detail.into(),
        }
    }

    /// True when re-analysis or recompilation cannot make the failure go
    /// away, so the guard should stop offering the call-site to devices.
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            OffloadError::UnsupportedConstruct { .. }
                | OffloadError::DependenceViolation { .. }
                | OffloadError::OverflowViolation { .. }
                | OffloadError::CompilationFailure { .. }
        )
    }

    /// Short class tag used in telemetry records.
    pub fn class(&self) -> &'static str {
        match self {
            OffloadError::UnsupportedConstruct { .. } => "unsupported",
            OffloadError::DependenceViolation { .. } => "dependence",
            OffloadError::BoundViolation { .. } => "bound",
            OffloadError::OverflowViolation { .. } => "overflow",
            OffloadError::CompilationFailure { .. } => "compilation",
            OffloadError::CapacityFailure { .. } => "capacity",
            OffloadError::DeviceFailure { .. } => "device",
        }
    }
}

pub type Result<T> = std::result::Result<T, OffloadError>;

/// Errors for the program snapshot round-trip used by tooling.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a program snapshot (bad magic header)")]
    BadMagic,
    #[error("snapshot version '{found}' does not match expected '{expected}'")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("snapshot does not replay: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_classes_cover_analysis_failures() {
        assert!(OffloadError::unsupported("f", "while with break").is_sticky());
        assert!(OffloadError::dependence("a", "read collides with write").is_sticky());
        assert!(OffloadError::compilation("build log").is_sticky());
        assert!(!OffloadError::bound("a", "index 9 over extent 8").is_sticky());
        assert!(!OffloadError::capacity("too large").is_sticky());
    }

    #[test]
    fn display_names_the_subject() {
        let err = OffloadError::dependence("prices", "read of prices[i-1] collides with write");
        assert!(err.to_string().contains("prices"));
        let err = OffloadError::capacity("Data too large for 'SimGPU' memory.");
        assert_eq!(err.to_string(), "Data too large for 'SimGPU' memory.");
    }
}
