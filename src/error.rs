use std::io;
use std::num::ParseIntError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("line {line}: key/value line before any mapping header: {text:?}")]
    UnexpectedKeyValueLine { line: usize, text: String },

    #[error("line {line}: invalid meminfo line: {text:?}")]
    InvalidMeminfoLine { line: usize, text: String },

    #[error("field {field}: malformed quantity {value:?}")]
    MalformedQuantity {
        field: String,
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("missing field: {field}")]
    MissingField { field: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
