pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument, {0}")]
    InvalidArgument(&'static str),
    #[error("no DNS resolver is registered")]
    NoResolver,
    #[error("a DNS resolver with the name '{0}' is already registered")]
    DuplicateName(String),
    #[error("DNS resolver does not have a name")]
    NoName,
    #[error("resolver backend error, {0}")]
    Backend(String),
    #[error("query set resolution has already started")]
    AlreadyStarted,
    #[error("malformed DNS record, {0}")]
    Malformed(&'static str),
    #[error("resolution completed without a result")]
    EmptyResult,
    #[error("resolution timed out")]
    Timeout,
}
