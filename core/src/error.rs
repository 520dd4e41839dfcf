use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("network error: {0}")]
    Network(String),
    #[error("too many redirects: {0}")]
    TooManyRedirects(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transfer stalled: {0}")]
    Stalled(String),
    #[error("transfer canceled")]
    Canceled,
    #[error("body write aborted")]
    BodyAborted,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(String),
}

impl CoreError {
    /// Maps a transport failure onto the matching variant so callers can
    /// tell a redirect loop or deadline apart from a plain connection error.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_redirect() {
            CoreError::TooManyRedirects(err.to_string())
        } else if err.is_timeout() {
            CoreError::Timeout(err.to_string())
        } else {
            CoreError::Network(err.to_string())
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
