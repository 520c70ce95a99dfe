#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Cbor {
        #[from]
        source: serde_cbor::Error,
    },
    #[error("frame of {len} bytes exceeds the configured maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("protocol violation: {0}")]
    Violation(#[from] crate::validate::Violation),
}

pub type Result<T> = std::result::Result<T, Error>;
