// Error taxonomy
//
// One enum for every failure the core can surface. Reconciliation states
// that are expected outcomes (still pending, already credited) are not
// errors and live on ConfirmationResult instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Unknown token, payment, or account. Surfaced to the caller, no retry.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A strict debit would take the balance negative.
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },

    /// The proxy configuration document is missing or malformed. Retrying
    /// cannot fix bad config; the operation fails outright.
    #[error("invalid proxy configuration: {0}")]
    ConfigInvalid(String),

    /// Key material that cannot be decoded into a usable private key.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Storage or filesystem I/O failure. Nothing was applied; retryable.
    #[error("persist failed: {0}")]
    PersistFailed(String),

    /// The configuration document was written durably but the proxy could
    /// not be signalled to reload it. The mutation stands; retryable.
    #[error("config written but reload signal failed: {0}")]
    ReloadFailed(String),

    /// Payment provider I/O failure. Retryable with backoff.
    #[error("payment provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::PersistFailed(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::PersistFailed(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::ProviderUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
