pub mod bencoding;
pub mod client;
pub mod config;
pub mod error;
pub mod magnet;
pub mod peer;
pub mod protocol;
pub mod torrent;
pub mod tracker;

pub use client::{Piece, PieceManager, PieceWork};
pub use config::{ClientConfig, RetryPolicy};
pub use error::{Error, Result};
pub use peer::{connect_all, PeerConnection, PeerLabels, PeerState};
pub use torrent::Torrent;
