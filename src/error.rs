//! Error types for building and running the forwarder.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building a configuration snapshot or talking to
/// upstreams.
///
/// Build-time variants abort the reload they belong to. Upstream variants are
/// logged by the dispatcher and never reach the DNS client.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Net(#[from] std::io::Error),

    #[error("invalid CIDR or address: {0}")]
    InvalidCidr(String),

    #[error("unknown query type: {0}")]
    UnknownQueryType(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("group {0} is defined more than once")]
    DuplicateGroup(String),

    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),

    #[error("invalid client subnet: {0}")]
    InvalidSubnet(String),

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("dns wire error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("upstream {0} timed out")]
    Timeout(String),

    #[error("upstream {0} answered with a mismatched id")]
    IdMismatch(String),

    #[error("ping {0} failed")]
    Ping(String),

    #[error("ipset {set}: {reason}")]
    Ipset { set: String, reason: String },

    #[error("configuration was replaced concurrently")]
    ReloadConflict,

    #[error("forwarder is shutting down")]
    Stopped,

    #[error("no groups configured")]
    NoGroups,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
