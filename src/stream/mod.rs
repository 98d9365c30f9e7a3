pub mod collector;
pub mod finnhub;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not connected")]
    NotConnected,
    #[error("socket error: {0}")]
    Socket(String),
    #[error("stream closed by peer")]
    Closed,
}
