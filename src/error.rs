use thiserror::Error;

/// Failures talking to the upstream event feed. All of these are transient
/// and handled by the retry supervisor.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("feed reported failure: {0}")]
    Upstream(String),

    #[error("failed to decode feed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("feed call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Reasons a raw event does not become a transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("event {0} is not a transfer")]
    NotTransfer(String),

    #[error("event from foreign contract {0}")]
    ForeignContract(String),

    #[error("event removed by chain reorganisation")]
    Removed,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid address in {field}: {reason}")]
    InvalidAddress { field: &'static str, reason: String },

    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
}

impl ParseError {
    /// Skips are expected traffic, not malformed input.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ParseError::NotTransfer(_) | ParseError::ForeignContract(_) | ParseError::Removed
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("transaction hash is empty")]
    EmptyHash,
    #[error("sender address is empty")]
    EmptySender,
    #[error("recipient address is empty")]
    EmptyRecipient,
    #[error("amount {0} is negative")]
    NegativeAmount(rust_decimal::Decimal),
    #[error("block number is zero")]
    ZeroBlock,
    #[error("timestamp is zero")]
    ZeroTimestamp,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored row: {0}")]
    InvalidRow(String),

    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("store worker failed: {0}")]
    Worker(String),
}

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("store query failed: {0}")]
    Store(#[from] StoreError),

    #[error("detector task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum HubError {
    #[error("hub is shut down")]
    Closed,

    #[error("hub command queue full")]
    Full,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        HubError::Transport(e.to_string())
    }
}

/// Startup-fatal configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("{name} must be positive, got {value}")]
    NotPositive { name: &'static str, value: f64 },
}
