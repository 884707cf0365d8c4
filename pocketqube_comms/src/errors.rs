use thiserror::Error;

use crate::radio::RadioError;

#[derive(Error, Debug)]
pub enum CommsError {
    #[error("radio: {0}")]
    Radio(#[from] RadioError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
