use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatasetError>;

/// Pipeline failures are fatal by design: a malformed record or a failed
/// analyzer call surfaces immediately instead of being skipped.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record at line {line}: {source}")]
    Json {
        line: usize,
        source: serde_json::Error,
    },

    #[error("malformed record: {0}")]
    Record(String),

    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("analyzer error: {0}")]
    Analyzer(String),

    #[error("vocabulary error: {0}")]
    Vocab(#[from] vocab::VocabError),
}
