use thiserror::Error;

use crate::cipher::CipherError;
use ebus_conf::ConfigError;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("config error, {0}")]
    Config(#[from] ConfigError),
    #[error("cipher error, {0}")]
    Cipher(#[from] CipherError),
    #[error("transport error, {0}")]
    Transport(anyhow::Error),
    #[error("json error, {0}")]
    Json(#[from] serde_json::Error),
    #[error("publish cancelled")]
    Cancelled,
    #[error("publish of message {id} failed after {attempts} attempts, {last}")]
    Exhausted { id: String, attempts: u32, last: Box<BusError> },
    #[error("bus client closed")]
    Closed,
}

impl BusError {
    #[inline]
    pub fn msg<M: std::fmt::Display>(msg: M) -> Self {
        BusError::Transport(anyhow::Error::msg(msg.to_string()))
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for BusError {
    #[inline]
    fn from(e: lapin::Error) -> Self {
        BusError::Transport(e.into())
    }
}
