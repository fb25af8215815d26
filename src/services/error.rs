/// Failures raised while analyzing a single media file.
///
/// Every variant is terminal for the job that produced it: the worker records
/// the display string as the job's FAILURE payload and never retries.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("Unable to read image: {0}")]
    Decode(String),

    #[error("Unable to open video: {0}")]
    Open(String),

    /// `extension` keeps its leading dot, or is empty when the file has none.
    #[error("Unsupported file type: {extension}")]
    UnsupportedType { extension: String },

    #[error("Failed to encode result image: {0}")]
    Encode(String),

    #[error("Internal analysis fault: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// Short machine-readable kind, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Open(_) => "open",
            Self::UnsupportedType { .. } => "unsupported_type",
            Self::Encode(_) => "encode",
            Self::Internal(_) => "internal",
        }
    }
}
