use serde::Serialize;

use crate::dispatch::SUPPORTED_EXTENSIONS;

/// The pipeline stage an error originated in.
/// Every failure that leaves the crate is tagged with one of these so that the
/// transport layer can tell a rejected upload apart from a model failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage
{
    Dispatch,
    Preprocessing,
    TensorPreparation,
    Inference,
    Visualization,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unsupported file format: {extension}. Supported formats: {}", SUPPORTED_EXTENSIONS.join(", "))]
    UnsupportedFormat { extension: String },
    #[error("Preprocessing failed: {0}")]
    Preprocessing(String),
    #[error("Tensor preparation failed: {0}")]
    TensorPreparation(String),
    #[error("Model inference failed: {0}")]
    Inference(String),
    #[error("Visualization failed: {0}")]
    Visualization(String),
    #[error("Preprocessing failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error
{
    pub fn stage(&self) -> PipelineStage
    {
        match self
        {
            Error::UnsupportedFormat { .. } => PipelineStage::Dispatch,
            Error::Preprocessing(_) | Error::Io(_) => PipelineStage::Preprocessing,
            Error::TensorPreparation(_) => PipelineStage::TensorPreparation,
            Error::Inference(_) => PipelineStage::Inference,
            Error::Visualization(_) => PipelineStage::Visualization,
        }
    }

    /// Converts the error into the record handed to the transport layer.
    pub fn to_record(&self) -> ErrorRecord
    {
        ErrorRecord {
            error: self.to_string(),
            stage: self.stage(),
        }
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
      S: serde::ser::Serializer,
    {
      serializer.serialize_str(self.to_string().as_ref())
    }
}

/// The user-visible form of a failed request.
/// Carries a human readable message and the stage that failed, never a backtrace.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
  pub error: String,
  pub stage: PipelineStage,
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn unsupported_format_lists_supported_extensions()
    {
        let error = Error::UnsupportedFormat { extension: ".gif".to_string() };
        let message = error.to_string();
        assert!(message.starts_with("Unsupported file format: .gif."));
        assert!(message.contains(".mha"));
        assert!(message.contains(".dicom"));
        assert!(message.contains(".tiff"));
        assert_eq!(error.stage(), PipelineStage::Dispatch);
    }

    #[test]
    fn record_serializes_message_and_stage()
    {
        let record = Error::TensorPreparation("image has no pixels".to_string()).to_record();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["error"], "Tensor preparation failed: image has no pixels");
        assert_eq!(value["stage"], "tensor_preparation");
    }

    #[test]
    fn io_errors_read_like_other_preprocessing_failures()
    {
        let error = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"));
        assert_eq!(error.stage(), PipelineStage::Preprocessing);
        assert_eq!(error.to_string(), "Preprocessing failed: no such file");
    }

    #[test]
    fn error_serializes_as_display_string()
    {
        let error = Error::Inference("shape mismatch".to_string());
        let serialized = serde_json::to_string(&error).unwrap();
        assert_eq!(serialized, "\"Model inference failed: shape mismatch\"");
    }
}
