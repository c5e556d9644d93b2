use thiserror::Error;

/// A rejected generation parameter. Every variant maps to a 400 response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Prompt cannot be empty")]
    EmptyPrompt,

    #[error("Prompt too long (max {max} characters)")]
    PromptTooLong { max: usize },

    #[error("Image size must be an integer")]
    ImageSizeNotInteger,

    #[error("Image size must be between {min} and {max}")]
    ImageSizeOutOfRange { min: u32, max: u32 },

    #[error("Guidance scale must be a number")]
    GuidanceNotNumber,

    #[error("Guidance scale must be between 0 and {max}")]
    GuidanceOutOfRange { max: f64 },

    #[error("Number of steps must be an integer")]
    StepsNotInteger,

    #[error("Number of steps must be between 1 and {max}")]
    StepsOutOfRange { max: u32 },
}

/// Failures surfaced by the generation server, one variant per HTTP class.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error(transparent)]
    InvalidArgument(#[from] ValidationError),

    #[error("Model {0} not found")]
    NotFound(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read model catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse model catalog: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model catalog is empty")]
    Empty,

    #[error("model {0} is listed more than once")]
    DuplicateModel(String),

    #[error("model {name} has min_img_size {min} greater than max_img_size {max}")]
    InvalidBounds { name: String, min: u32, max: u32 },

    #[error("model {0} is not in the catalog")]
    UnknownModel(String),
}
