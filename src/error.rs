/// Failure of a pipeline call. Each variant maps onto one stable wire code.
#[derive(Debug, thiserror::Error)]
pub enum CalcError {
    #[error("{0}")]
    BadParams(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Conflict {
        message: String,
        details: Option<serde_json::Value>,
    },
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CalcError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::BadParams(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::Conflict {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadParams(_) => "bad_params",
            Self::NotFound(_) => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Config(_) => "bad_config",
            Self::Db(_) => "db_query_failed",
            Self::Json(_) => "bad_json",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Conflict { details, .. } => details.clone(),
            _ => None,
        }
    }
}

pub type CalcResult<T> = Result<T, CalcError>;
