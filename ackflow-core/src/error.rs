use thiserror::Error;

use crate::ack::TokenId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("metrics Error - {0}")]
    Metrics(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Topology Error - {0}")]
    Topology(String),

    #[error("Transformer Error - {0}")]
    Transformer(String),

    #[error("Forwarder Error - {0}")]
    Forwarder(String),

    /// A share was requested on a token that already reached `Resolved` or `Failed`. This is a
    /// fan-out bug, callers must treat it as an internal assertion failure.
    #[error("Token {token} is already terminal, cannot add obligation shares")]
    TokenAlreadyTerminal { token: TokenId },
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Config(value.to_string())
    }
}
