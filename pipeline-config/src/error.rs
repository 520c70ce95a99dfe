#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("{source}")]
    ShellExpandLookupVar {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("confidence_threshold must be in [0, 1], got {0}")]
    InvalidConfidenceThreshold(f32),
    #[error("segment_duration_s must be positive")]
    InvalidSegmentDuration,
}

pub type Result<T> = std::result::Result<T, Error>;
