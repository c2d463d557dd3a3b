use thiserror::Error;

use crate::{
    config::ConfigError,
    event::{EventError, HandlerError, SchemaError},
    session::SessionError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    // event error
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
    // session
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

// エラー作成用のヘルパー関数
impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
