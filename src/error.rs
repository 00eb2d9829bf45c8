//! Crate-wide error type.
//!
//! Per-peer errors never propagate past the peer session, per-tracker errors
//! never propagate past the tracker client; only torrent file / startup
//! errors are meant to reach a user-visible abort. This type is shared by
//! all of those call sites so that each subsystem can convert its failures
//! with `?` and let the caller decide how far to let them travel.

use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("bencode decode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid torrent file: {0}")]
    InvalidTorrentFile(String),

    #[error("invalid piece index")]
    InvalidPieceIndex,

    #[error("offset {offset} + length {length} exceeds piece length {piece_len}")]
    OutOfRange {
        offset: u32,
        length: u32,
        piece_len: u32,
    },

    #[error("write at offset {offset} overlaps already-stored bytes in piece {piece_index}")]
    OverlapWrite { piece_index: crate::PieceIndex, offset: u32 },

    #[error("read from unverified piece {0}")]
    UnverifiedRead(crate::PieceIndex),

    #[error("peer sent handshake with mismatched info hash")]
    InvalidPeerInfoHash,

    #[error("peer sent bitfield of wrong length: expected {expected}, got {actual}")]
    InvalidBitfieldLength { expected: usize, actual: usize },

    #[error("peer sent bitfield message outside of availability exchange")]
    BitfieldNotAfterHandshake,

    #[error("peer is not a seed, cannot download from it")]
    PeerNotSeed,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("tracker failure: {0}")]
    TrackerFailure(String),

    #[error("tracker response was malformed: {0}")]
    InvalidTrackerResponse(String),

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedTrackerScheme(String),

    #[error("invalid torrent id")]
    InvalidTorrentId,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed("mpsc channel receiver dropped")
    }
}
