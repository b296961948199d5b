use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("unknown object: {0}")]
    UnknownObject(String),
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),
    #[error("missing dependency: {0}")]
    MissingDependency(String),
}
