use thiserror::Error;

pub type Result<T> = std::result::Result<T, JudgeError>;

/// Errors surfaced to the code calling into the judge.
///
/// Failures inside a judgment (sandbox I/O, backend crashes) never use this
/// type; they become a `System Error` verdict instead.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("invalid resource limits: {0}")]
    InvalidLimits(&'static str),

    #[error("unsupported language `{0}`")]
    UnsupportedLanguage(String),

    #[error("problem `{0}` not found")]
    ProblemNotFound(String),

    #[error("submission `{0}` not found")]
    SubmissionNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read `{path}`")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed json in `{path}`")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
