//! The piece/file store: owns on-disk data and the in-memory piece buffers,
//! accepts block writes, verifies pieces against their expected SHA-1
//! hashes, answers read requests, and reports what's still missing.
//!
//! Architecturally this follows the disk actor pattern: a `Disk` task owns
//! all piece buffers and file handles and is driven exclusively through a
//! command channel, posting alerts back on piece completion. Callers get a
//! cheap, cloneable [`PieceStoreHandle`] to talk to it. Hashing and
//! synchronous file IO are off-loaded to `spawn_blocking` so the task never
//! blocks the reactor.

use std::{
    convert::TryInto,
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom},
    os::unix::io::AsRawFd,
    sync::{Arc, Mutex},
};

use bitvec::prelude::{BitVec, Msb0};
use nix::sys::uio::{pread, pwrite};
use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task};

use crate::{
    block_count, block_len,
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure, StorageInfo},
    PieceIndex, Sha1Hash, BLOCK_LEN,
};

/// Fixed block size used for request scheduling; 16 KiB.
pub const BLOCK_SIZE: u32 = BLOCK_LEN;

/// The tri-state verification status of a piece, derived from its stored
/// mask and an explicit verified flag (distinct states are needed because a
/// fully-masked-but-unverified piece cannot occur: a piece is hashed the
/// moment its mask becomes full, and on mismatch reset to empty).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceState {
    Empty,
    Partial,
    Verified,
}

/// A single piece's write buffer and verification state.
struct Piece {
    expected_hash: Sha1Hash,
    len: u32,
    buffer: Vec<u8>,
    /// One bit per byte of `buffer`; set once that byte has been written.
    stored_mask: BitVec<Msb0, u8>,
    verified: bool,
}

impl Piece {
    fn empty(len: u32, expected_hash: Sha1Hash) -> Self {
        Self {
            expected_hash,
            len,
            buffer: vec![0; len as usize],
            stored_mask: BitVec::repeat(false, len as usize),
            verified: false,
        }
    }

    fn state(&self) -> PieceState {
        if self.verified {
            PieceState::Verified
        } else if self.stored_mask.any() {
            PieceState::Partial
        } else {
            PieceState::Empty
        }
    }

    fn is_full(&self) -> bool {
        self.stored_mask.all()
    }

    /// Writes `data` at `offset`, rejecting out of range or overlapping
    /// writes. Returns whether the piece just became verified.
    fn store(&mut self, offset: u32, data: &[u8], index: PieceIndex) -> Result<bool> {
        let end = offset as u64 + data.len() as u64;
        if end > self.len as u64 {
            return Err(Error::OutOfRange {
                offset,
                length: data.len() as u32,
                piece_len: self.len,
            });
        }

        let range = offset as usize..offset as usize + data.len();
        if self.stored_mask[range.clone()].any() {
            return Err(Error::OverlapWrite {
                piece_index: index,
                offset,
            });
        }

        self.buffer[range.clone()].copy_from_slice(data);
        self.stored_mask[range].iter_mut().for_each(|mut bit| *bit = true);

        if self.is_full() {
            if self.matches_hash() {
                self.verified = true;
                return Ok(true);
            } else {
                log::warn!("piece {} hash mismatch, resetting", index);
                self.buffer.iter_mut().for_each(|b| *b = 0);
                self.stored_mask.iter_mut().for_each(|mut b| *b = false);
            }
        }
        Ok(false)
    }

    fn matches_hash(&self) -> bool {
        let digest = Sha1::digest(&self.buffer);
        digest.as_slice() == self.expected_hash
    }

    /// Returns up to `max_count` free (unstored) block ranges, in ascending
    /// order, each at most [`BLOCK_SIZE`] long.
    fn free_blocks(&self, max_count: usize) -> Vec<(u32, u32)> {
        let mut blocks = Vec::new();
        let count = block_count(self.len);
        for i in 0..count {
            if blocks.len() >= max_count {
                break;
            }
            let offset = i as u32 * BLOCK_SIZE;
            let len = block_len(self.len, i);
            let range = offset as usize..offset as usize + len as usize;
            if !self.stored_mask[range].any() {
                blocks.push((offset, len));
            }
        }
        blocks
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

/// Owns an open torrent's on-disk data, piece buffers, and file handles.
struct Torrent {
    info: StorageInfo,
    piece_hashes: Vec<Sha1Hash>,
    pieces: Vec<Piece>,
    files: Arc<Vec<Mutex<TorrentFile>>>,
}

impl Torrent {
    fn new(info: StorageInfo, piece_hashes: Vec<Sha1Hash>) -> Result<Self> {
        fs::create_dir_all(&info.download_dir)?;

        let open_file = |file: &FileInfo| -> Result<Mutex<TorrentFile>> {
            if let Some(parent) = file.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&file.path)?;
            Ok(Mutex::new(TorrentFile {
                info: file.clone(),
                handle,
            }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                let file = FileInfo {
                    path: info.download_dir.join(&file.path),
                    torrent_offset: file.torrent_offset,
                    len: file.len,
                };
                vec![open_file(&file)?]
            }
            FsStructure::Archive { files } => {
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files {
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    };
                    torrent_files.push(open_file(&file)?);
                }
                torrent_files
            }
        };

        let mut pieces = Vec::with_capacity(piece_hashes.len());
        for index in 0..piece_hashes.len() {
            let len = info.piece_len(index)?;
            pieces.push(Piece::empty(len, piece_hashes[index]));
        }

        let mut torrent = Self {
            info,
            piece_hashes,
            pieces,
            files: Arc::new(files),
        };
        torrent.read_existing();
        Ok(torrent)
    }

    /// Reads whatever bytes already exist on disk into each piece's buffer
    /// and verifies what it can. I/O failures here are non-fatal: the piece
    /// is simply left empty.
    fn read_existing(&mut self) {
        for index in 0..self.pieces.len() {
            if let Err(e) = self.read_existing_piece(index) {
                log::debug!("piece {} not readable from disk: {}", index, e);
            }
        }
    }

    fn read_existing_piece(&mut self, index: PieceIndex) -> Result<()> {
        let piece_len = self.info.piece_len(index)?;
        let piece_torrent_offset = index as u64 * self.info.piece_len as u64;
        let file_range = self.info.files_intersecting_piece(index)?;

        let mut buffer = vec![0u8; piece_len as usize];
        let mut written = 0usize;
        for file_index in file_range {
            let file = self.files[file_index].lock().unwrap();
            let slice = file
                .info
                .get_slice(piece_torrent_offset + written as u64, piece_len as u64 - written as u64);
            if slice.len == 0 {
                continue;
            }
            let mut file_buf = vec![0u8; slice.len as usize];
            let mut handle = &file.handle;
            handle.seek(SeekFrom::Start(slice.offset))?;
            handle.read_exact(&mut file_buf)?;
            buffer[written..written + slice.len as usize].copy_from_slice(&file_buf);
            written += slice.len as usize;
        }

        let piece = &mut self.pieces[index];
        let digest = Sha1::digest(&buffer);
        if digest.as_slice() == piece.expected_hash {
            piece.buffer = buffer;
            piece.stored_mask = BitVec::repeat(true, piece_len as usize);
            piece.verified = true;
        }
        Ok(())
    }

    fn store(&mut self, index: PieceIndex, offset: u32, data: Vec<u8>) -> Result<bool> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        let became_verified = piece.store(offset, &data, index)?;
        if became_verified {
            self.write_piece_to_disk(index)?;
        }
        Ok(became_verified)
    }

    fn write_piece_to_disk(&self, index: PieceIndex) -> Result<()> {
        let piece = &self.pieces[index];
        let piece_torrent_offset = index as u64 * self.info.piece_len as u64;
        let file_range = self.info.files_intersecting_piece(index)?;

        let mut written = 0u64;
        for file_index in file_range {
            let file = self.files[file_index].lock().unwrap();
            let slice = file
                .info
                .get_slice(piece_torrent_offset + written, piece.len as u64 - written);
            if slice.len == 0 {
                continue;
            }
            let chunk =
                &piece.buffer[written as usize..written as usize + slice.len as usize];
            write_all_at(&file.handle, chunk, slice.offset)?;
            written += slice.len;
        }
        Ok(())
    }

    fn retrieve(&self, index: PieceIndex, offset: u32, length: u32) -> Result<Vec<u8>> {
        let piece = self
            .pieces
            .get(index)
            .ok_or(Error::InvalidPieceIndex)?;
        if !piece.verified {
            return Err(Error::UnverifiedRead(index));
        }
        let end = offset as u64 + length as u64;
        if end > piece.len as u64 {
            return Err(Error::OutOfRange {
                offset,
                length,
                piece_len: piece.len,
            });
        }
        let start = offset as usize;
        let end = end as usize;
        Ok(piece.buffer[start..end].to_vec())
    }

    fn get_free_blocks(&self, index: PieceIndex, max_count: usize) -> Result<Vec<(u32, u32)>> {
        let piece = self.pieces.get(index).ok_or(Error::InvalidPieceIndex)?;
        Ok(piece.free_blocks(max_count))
    }

    fn is_piece_full(&self, index: PieceIndex) -> Result<bool> {
        let piece = self.pieces.get(index).ok_or(Error::InvalidPieceIndex)?;
        Ok(piece.is_full())
    }

    fn verified_ratio(&self) -> (usize, usize) {
        let verified = self.pieces.iter().filter(|p| p.verified).count();
        (verified, self.pieces.len())
    }

    fn missing_piece_indices(&self) -> Vec<PieceIndex> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.verified)
            .map(|(i, _)| i)
            .collect()
    }

    fn complete(&self) -> bool {
        self.pieces.iter().all(|p| p.verified)
    }
}

/// Performs a positioned write, retrying until the whole buffer has been
/// written (a single `pwrite` syscall is not guaranteed to consume it all).
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    let fd = file.as_raw_fd();
    while !buf.is_empty() {
        let n = pwrite(fd, buf, offset as i64)
            .map_err(|_| std::io::Error::last_os_error())?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Unused by the store itself, kept for symmetry with `write_all_at` and
/// for callers that want to re-read what was just flushed to disk.
#[allow(dead_code)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    pread(file.as_raw_fd(), buf, offset as i64)
        .map_err(|_| std::io::Error::last_os_error())
}

/// Commands accepted by the [`Disk`] actor.
enum Command {
    Store {
        index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
        reply: mpsc::UnboundedSender<Alert>,
    },
    Retrieve {
        index: PieceIndex,
        offset: u32,
        length: u32,
        reply: mpsc::UnboundedSender<Alert>,
    },
    Status {
        reply: mpsc::UnboundedSender<Alert>,
    },
    Shutdown,
}

/// Alerts sent back to callers of the [`Disk`] actor.
pub enum Alert {
    Stored {
        index: PieceIndex,
        became_verified: bool,
    },
    StoreFailed(Error),
    Retrieved(Result<Vec<u8>>),
    Status {
        verified: usize,
        total: usize,
        missing: Vec<PieceIndex>,
    },
}

/// The disk actor: owns all piece and file state, driven via [`Command`]s.
struct Disk {
    torrent: Torrent,
    cmd_port: mpsc::UnboundedReceiver<Command>,
}

impl Disk {
    async fn run(&mut self) {
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::Store {
                    index,
                    offset,
                    data,
                    reply,
                } => {
                    let result = self.torrent.store(index, offset, data);
                    let alert = match result {
                        Ok(became_verified) => Alert::Stored {
                            index,
                            became_verified,
                        },
                        Err(e) => Alert::StoreFailed(e),
                    };
                    let _ = reply.send(alert);
                }
                Command::Retrieve {
                    index,
                    offset,
                    length,
                    reply,
                } => {
                    let result = self.torrent.retrieve(index, offset, length);
                    let _ = reply.send(Alert::Retrieved(result));
                }
                Command::Status { reply } => {
                    let (verified, total) = self.torrent.verified_ratio();
                    let missing = self.torrent.missing_piece_indices();
                    let _ = reply.send(Alert::Status {
                        verified,
                        total,
                        missing,
                    });
                }
                Command::Shutdown => break,
            }
        }
    }
}

/// A cheap, cloneable handle used to talk to a running [`Disk`] task.
#[derive(Clone)]
pub struct PieceStoreHandle {
    cmd_chan: mpsc::UnboundedSender<Command>,
}

impl PieceStoreHandle {
    /// Spawns the disk actor for a torrent, performing the (blocking)
    /// startup file scan on a worker thread.
    pub async fn spawn(
        info: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
    ) -> Result<Self> {
        let torrent = task::spawn_blocking(move || Torrent::new(info, piece_hashes))
            .await
            .expect("disk startup task panicked")?;

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let mut disk = Disk { torrent, cmd_port };
        tokio::spawn(async move { disk.run().await });

        Ok(Self { cmd_chan })
    }

    pub async fn store(&self, index: PieceIndex, offset: u32, data: Vec<u8>) -> Result<bool> {
        let (reply, mut reply_port) = mpsc::unbounded_channel();
        self.cmd_chan.send(Command::Store {
            index,
            offset,
            data,
            reply,
        })?;
        match reply_port.recv().await {
            Some(Alert::Stored { became_verified, .. }) => Ok(became_verified),
            Some(Alert::StoreFailed(e)) => Err(e),
            _ => Err(Error::ChannelClosed("piece store disk task gone")),
        }
    }

    pub async fn retrieve(&self, index: PieceIndex, offset: u32, length: u32) -> Result<Vec<u8>> {
        let (reply, mut reply_port) = mpsc::unbounded_channel();
        self.cmd_chan.send(Command::Retrieve {
            index,
            offset,
            length,
            reply,
        })?;
        match reply_port.recv().await {
            Some(Alert::Retrieved(result)) => result,
            _ => Err(Error::ChannelClosed("piece store disk task gone")),
        }
    }

    /// Returns `(verified, total)` piece counts and the indices of pieces
    /// still missing.
    pub async fn status(&self) -> Result<(usize, usize, Vec<PieceIndex>)> {
        let (reply, mut reply_port) = mpsc::unbounded_channel();
        self.cmd_chan.send(Command::Status { reply })?;
        match reply_port.recv().await {
            Some(Alert::Status { verified, total, missing }) => Ok((verified, total, missing)),
            _ => Err(Error::ChannelClosed("piece store disk task gone")),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_chan.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn hash_of(data: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(data);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    fn storage_info(piece_len: u32, last_piece_len: u32, piece_count: usize, download_len: u64, dir: PathBuf) -> StorageInfo {
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: dir,
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("test-file"),
                len: download_len,
                torrent_offset: 0,
            }),
        }
    }

    #[test]
    fn store_rejects_out_of_range() {
        let mut piece = Piece::empty(16384, [0; 20]);
        let data = vec![0u8; 10];
        let err = piece.store(16380, &data, 0).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn store_rejects_overlap_and_verifies_on_full_write() {
        let data = vec![7u8; 16384];
        let expected_hash = hash_of(&data);
        let mut piece = Piece::empty(16384, expected_hash);

        assert!(!piece.store(0, &data[0..4096], 0).unwrap());
        assert!(!piece.store(4096, &data[4096..8192], 0).unwrap());
        let became_verified = piece.store(8192, &data[8192..16384], 0).unwrap();
        assert!(became_verified);
        assert_eq!(piece.state(), PieceState::Verified);

        // writing again, even a single byte, must be rejected as overlap
        let err = piece.store(0, &[1], 0).unwrap_err();
        assert!(matches!(err, Error::OverlapWrite { .. }));
        // piece must still be verified
        assert_eq!(piece.state(), PieceState::Verified);
    }

    #[test]
    fn mismatched_hash_resets_piece_to_empty() {
        let data = vec![7u8; 16384];
        // wrong hash on purpose
        let mut piece = Piece::empty(16384, [0xAB; 20]);
        let became_verified = piece.store(0, &data, 0).unwrap();
        assert!(!became_verified);
        assert_eq!(piece.state(), PieceState::Empty);
        assert!(piece.buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn free_blocks_are_ascending_and_bounded() {
        let mut piece = Piece::empty(40000, [0; 20]);
        piece.stored_mask[0..16384].iter_mut().for_each(|mut b| *b = true);
        let blocks = piece.free_blocks(10);
        assert_eq!(blocks, vec![(16384, 16384), (32768, 7232)]);
    }

    #[tokio::test]
    async fn full_torrent_round_trips_through_disk_task() {
        let dir = tempdir();
        let piece_len = 16384u32;
        let data_a = vec![1u8; piece_len as usize];
        let data_b = vec![2u8; piece_len as usize];
        let hashes = vec![hash_of(&data_a), hash_of(&data_b)];
        let info = storage_info(piece_len, piece_len, 2, piece_len as u64 * 2, dir.clone());

        let store = PieceStoreHandle::spawn(info, hashes).await.unwrap();
        assert!(store.store(0, 0, data_a.clone()).await.unwrap());
        assert!(store.store(1, 0, data_b.clone()).await.unwrap());

        let read_back = store.retrieve(0, 0, piece_len).await.unwrap();
        assert_eq!(read_back, data_a);

        let err = store.retrieve(0, piece_len - 10, 20).await.unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));

        let _ = fs::remove_dir_all(dir);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("piece_store_test_{}", std::process::id()));
        dir
    }
}
