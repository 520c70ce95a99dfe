//! Top-level error type for the worker, following `flydra2::error::Error`'s
//! one-variant-per-source shape.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    SerdeJson {
        #[from]
        source: serde_json::Error,
    },
    #[error("{source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
    #[error("{source}")]
    Protocol {
        #[from]
        source: protocol::Error,
    },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("model load failed for `{model}`: {message}")]
    ModelLoad { model: String, message: String },
    #[error("model pool thread is gone")]
    ModelPoolGone,
    #[error("session writer invariant violated: {0}")]
    SessionWriter(String),
}

pub type Result<T> = std::result::Result<T, Error>;
