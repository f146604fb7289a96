use std::io;

use thiserror::Error;

use crate::bencoding::ParseError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed bencode: {0}")]
    Parse(#[from] ParseError),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Piece {index} failed verification: expected {expected}, got {actual}")]
    Verification {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("The peer took too long to respond")]
    Timeout,

    #[error("Dictionary key `{0}` is missing")]
    MissingKey(String),

    #[error("Dictionary key `{key}` is not a {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Invalid torrent metainfo: {0}")]
    Metainfo(String),

    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid magnet link: {0}")]
    Magnet(String),

    #[error("Metadata exchange failed: {0}")]
    Metadata(String),

    #[error("No usable peers")]
    NoPeers,

    #[error("Piece {index} gave up after {attempts} attempts")]
    RetriesExhausted { index: u32, attempts: u32 },

    #[error("Every worker exited with {remaining} pieces still missing")]
    WorkersExhausted { remaining: usize },
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
