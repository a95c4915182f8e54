use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Error while performing (de)serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate sample second for {0}")]
    DuplicateSample(String),

    #[error("Static data row must exist before dynamic rows are written")]
    MissingStaticRow,

    #[error("No such row: {0}")]
    NotFound(String),

    #[error("Schema drift detected in table {0}")]
    SchemaDrift(String),

    #[error("Connection failure: {0}")]
    ConnectionError(String),

    #[error("Unknown database error: {0}")]
    General(String),
}

impl DbError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "storage.error.sqlite",
            Self::Serialization(_) => "storage.error.serialization",
            Self::DuplicateSample(_) => "storage.error.duplicate_sample",
            Self::MissingStaticRow => "storage.error.missing_static",
            Self::NotFound(_) => "storage.error.not_found",
            Self::SchemaDrift(_) => "storage.error.drift",
            Self::ConnectionError(_) => "storage.error.connection",
            Self::General(_) => "storage.error.general",
        }
    }
}
