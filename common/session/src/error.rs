use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionTokenError {
    #[error("malformed session token '{0}'")]
    Malformed(String),
    #[error("session token entry '{0}' is missing its partition key range id")]
    MissingRangeId(String),
    #[error("unknown consistency level '{0}'")]
    UnknownConsistencyLevel(String),
}
