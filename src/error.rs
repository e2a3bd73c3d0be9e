use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("QR chunk mismatch: {0}")]
    ChunkMismatch(String),
    #[error("No information for input box {0}")]
    IncompleteInputData(String),
    #[error("Could not resolve payment request: {0}")]
    ResolutionFailed(String),
    #[error("Payment request needs an address")]
    MissingAddress,
    #[error("Payment request is for address {requested}, not {supplied}")]
    AddressMismatch { requested: String, supplied: String },
    #[error("Not an ergopay request")]
    NotPayLink,
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
