use thiserror::Error;

#[derive(Error, Debug)]
pub enum CnpError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Invalid capability entry: {0}")]
    InvalidCapability(String),

    #[error("Invalid machine spec: {0}")]
    InvalidMachineSpec(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CnpError>;
