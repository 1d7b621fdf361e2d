use std::fmt;
use std::path::PathBuf;

/// Fatal pipeline failures. Dropped rows are not errors; they are logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    DataSource { path: PathBuf, reason: String },
    EmptyDataset { path: PathBuf },
    InvalidConfig { reason: String },
}

impl PipelineError {
    pub fn data_source(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        PipelineError::DataSource {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::DataSource { path, reason } => {
                write!(f, "data source {:?} unavailable: {}", path, reason)
            }
            PipelineError::EmptyDataset { path } => {
                write!(f, "no valid bottleneck rows in {:?}; map center is undefined", path)
            }
            PipelineError::InvalidConfig { reason } => write!(f, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for PipelineError {}
