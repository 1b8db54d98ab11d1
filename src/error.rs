use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("macro name is required")]
    InvalidMacroName,

    #[error("macro function is required for '{0}'")]
    MissingMacroFunction(String),

    #[error("macro already exists: {0}")]
    DuplicateMacro(String),

    #[error("macro not found: {0}")]
    MacroNotFound(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),
}

impl Error {
    /// True for errors raised while registering a macro (missing name or function).
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::InvalidMacroName | Error::MissingMacroFunction(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
