use thiserror::Error;

/// Main error type for the siamese crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SiameseError {
    /// Shape-related errors with detailed suggestions
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// No example with a matching (or differing) label could be drawn
    #[error("Label not found: no {role} example for label {label} after {attempts} draws")]
    LabelNotFound {
        role: &'static str,
        label: usize,
        attempts: usize,
    },

    /// Index outside the dataset bounds
    #[error("Index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// Operation errors with context
    #[error("Operation error: {operation} - {message}")]
    OperationError {
        operation: String,
        message: String,
    },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Data-related errors
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),
}

impl SiameseError {
    /// Shape mismatch between what a step expected and what it received
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        SiameseError::ShapeError(match suggestion {
            Some(hint) => format!("Expected {expected}, got {got}. Suggestion: {hint}"),
            None => format!("Expected {expected}, got {got}"),
        })
    }

    /// Create an operation error with context
    pub fn operation_error(operation: &str, message: &str) -> Self {
        SiameseError::OperationError {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for SiameseError {
    fn from(err: std::io::Error) -> Self {
        SiameseError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for SiameseError {
    fn from(err: serde_json::Error) -> Self {
        SiameseError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for SiameseError {
    fn from(err: bincode::Error) -> Self {
        SiameseError::SerializationError(err.to_string())
    }
}

/// Result type for siamese operations
pub type SiameseResult<T> = Result<T, SiameseError>;

/// Where an error surfaced: the step being run, the shapes it saw and a hint for the caller
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub step: String,
    pub shapes: Vec<String>,
    pub hint: Option<String>,
}

impl ErrorContext {
    pub fn new(step: impl Into<String>) -> Self {
        Self { step: step.into(), ..Self::default() }
    }

    pub fn with_shape(mut self, shape: impl Into<String>) -> Self {
        self.shapes.push(shape.into());
        self
    }

    /// Replaces any earlier hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!("while trying to {}", self.step);
        if !self.shapes.is_empty() {
            out += &format!(" (shapes {})", self.shapes.join(" vs "));
        }
        if let Some(hint) = &self.hint {
            out += &format!("; hint: {}", hint);
        }
        out
    }
}

/// Attach an [`ErrorContext`] to shape, operation and data errors
pub trait WithContext<T> {
    fn with_context<F>(self, f: F) -> SiameseResult<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> WithContext<T> for SiameseResult<T> {
    fn with_context<F>(self, f: F) -> SiameseResult<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| {
            let suffix = f().render();
            match e {
                SiameseError::ShapeError(msg) => SiameseError::ShapeError(format!("{msg}, {suffix}")),
                SiameseError::OperationError { operation, message } => SiameseError::OperationError {
                    operation,
                    message: format!("{message}, {suffix}"),
                },
                SiameseError::InvalidData(msg) => SiameseError::InvalidData(format!("{msg}, {suffix}")),
                other => other,
            }
        })
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    LabelNotFound,
    OutOfRange,
    InvalidOperation,
    SerializationFailed,
    ConfigInvalid,
    Io,
}

impl SiameseError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            SiameseError::ShapeError(_) => ErrorCode::ShapeMismatch,
            SiameseError::LabelNotFound { .. } => ErrorCode::LabelNotFound,
            SiameseError::IndexOutOfRange { .. } => ErrorCode::OutOfRange,
            SiameseError::OperationError { .. } => ErrorCode::InvalidOperation,
            SiameseError::SerializationError(_) => ErrorCode::SerializationFailed,
            SiameseError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            SiameseError::InvalidData(_) => ErrorCode::InvalidOperation,
            SiameseError::InvalidInput(_) => ErrorCode::InvalidOperation,
            SiameseError::IoError(_) => ErrorCode::Io,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            SiameseError::ShapeError(msg) => {
                format!("Shape Error: {}\n\nThe anchor, positive and negative batches (or a layer and its input) do not agree on their dimensions.", msg)
            }
            SiameseError::LabelNotFound { role, label, .. } => {
                format!("Label Error: could not draw a {} example for label {}.\n\nTriplet sampling needs at least two distinct labels in the dataset; raise sampler.max_retries if one label is rare.", role, label)
            }
            SiameseError::ConfigurationError(msg) => {
                format!("Configuration Error: {}\n\nCheck the configuration file or command line arguments.", msg)
            }
            _ => self.to_string(),
        }
    }
}
