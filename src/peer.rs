mod codec;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use futures::{select, stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time::{self, Duration},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    bitfield,
    counter::ThroughputCounter,
    error::*,
    piece_picker::PiecePicker,
    piece_store::PieceStoreHandle,
    torrent::SharedStatus,
    Bitfield, BlockInfo, PeerId, PieceIndex,
};
use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// Shared, concurrently-accessible state for a single peer connection.
///
/// This is the table entry `PeerManager` keeps in its connection map (see
/// spec's concurrency model): everything the choke algorithm and have
/// broadcaster need to read or mutate from the main tick without going
/// through the session's own message loop.
pub(crate) struct PeerShared {
    pub remote_bitfield: RwLock<Bitfield>,
    pub peer_interested: AtomicBool,
    pub am_choking: AtomicBool,
    pub am_interested: AtomicBool,
    pub peer_choking: AtomicBool,
    /// Mean of the rolling `download_samples` window; what the choke
    /// algorithm actually reads, kept in an atomic for lock-free access.
    pub download_rate: AtomicU64,
    /// One `piece_length / elapsed_seconds` sample per completed piece,
    /// bounded to the last 100 (spec's rate-averaging window).
    pub download_samples: std::sync::Mutex<ThroughputCounter>,
    pub ready: AtomicBool,
}

impl Default for PeerShared {
    fn default() -> Self {
        Self {
            remote_bitfield: RwLock::new(Bitfield::new()),
            peer_interested: AtomicBool::new(false),
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            download_rate: AtomicU64::new(0),
            download_samples: std::sync::Mutex::new(ThroughputCounter::new()),
            ready: AtomicBool::new(false),
        }
    }
}

/// Messages `PeerManager` sends down to a running session.
pub(crate) enum Command {
    Shutdown,
    /// A piece completed locally; relay a `have` to this peer.
    Have(PieceIndex),
    /// Scheduler tick: try to pick up a new piece or continue the current
    /// one now that global state (choking, expiry) may have changed.
    Poke,
    /// The choke algorithm flipped this peer's choke state; relay the
    /// corresponding `choke`/`unchoke` on the wire.
    SetChoke(bool),
}

/// Alerts a session sends up to `PeerManager`.
pub(crate) enum Alert {
    PieceVerified(PieceIndex),
    Disconnected,
}

pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    store: PieceStoreHandle,
    shared: Arc<PeerShared>,
    self_handle: usize,
    cmd_port: Receiver,
    alert_chan: UnboundedSender<Alert>,
    addr: SocketAddr,
    peer_info: Option<PeerInfo>,
    /// Blocks we've requested from this peer for the piece currently
    /// assigned to us, awaiting their `piece` replies.
    outgoing_requests: Vec<BlockInfo>,
    download_start: Option<Instant>,
}

struct PeerInfo {
    #[allow(dead_code)]
    peer_id: PeerId,
}

impl PeerSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        store: PieceStoreHandle,
        shared: Arc<PeerShared>,
        self_handle: usize,
        alert_chan: UnboundedSender<Alert>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_picker,
                store,
                shared,
                self_handle,
                cmd_port,
                alert_chan,
                addr,
                peer_info: None,
                outgoing_requests: Vec::new(),
                download_start: None,
            },
            cmd_chan,
        )
    }

    /// Connects to `addr`, performs the outbound handshake, and runs the
    /// session until the connection closes or a fatal protocol error
    /// occurs.
    pub async fn run_outbound(&mut self) -> Result<()> {
        log::info!("connecting to peer {}", self.addr);
        let socket = match time::timeout(Duration::from_secs(1), TcpStream::connect(self.addr)).await {
            Ok(result) => result?,
            Err(_) => {
                log::warn!("connect to {} timed out", self.addr);
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect attempt timed out",
                )));
            }
        };
        let mut socket = Framed::new(socket, HandshakeCodec);

        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        self.complete_handshake(socket, true).await
    }

    /// Runs a session for an already-accepted inbound socket, waiting for
    /// the peer's handshake before replying with ours.
    pub async fn run_inbound(&mut self, socket: TcpStream) -> Result<()> {
        let socket = Framed::new(socket, HandshakeCodec);
        self.complete_handshake(socket, false).await
    }

    async fn complete_handshake(
        &mut self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        we_initiated: bool,
    ) -> Result<()> {
        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(Error::ChannelClosed("peer closed before handshake")),
        };

        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("peer {} sent mismatched info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
        });

        if !we_initiated {
            let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id);
            socket.send(handshake).await?;
        }

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        // advertise our own availability before entering the steady state
        let local_bitfield = self.torrent.local_bitfield.read().await.clone();
        let (mut sink, stream) = socket.split();
        sink.send(Message::Bitfield(local_bitfield)).await?;

        let result = self.run(sink, stream).await;
        let _ = self.alert_chan.send(Alert::Disconnected);
        result
    }

    async fn run(
        &mut self,
        mut sink: SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        stream: impl futures::Stream<Item = std::result::Result<Message, Error>> + Unpin,
    ) -> Result<()> {
        let mut stream = stream.fuse();
        let mut bitfield_exchanged = false;
        let mut keepalive_timer = time::interval(Duration::from_secs(30));

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    if !bitfield_exchanged {
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield(&mut sink, bitfield).await?;
                            bitfield_exchanged = true;
                            self.shared.ready.store(true, Ordering::SeqCst);
                        } else {
                            log::warn!("peer {} didn't send bitfield first", self.addr);
                            return Err(Error::BitfieldNotAfterHandshake);
                        }
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("shutting down peer {} session", self.addr);
                            break;
                        }
                        Some(Command::Have(index)) => {
                            sink.send(Message::Have { piece_index: index as u32 }).await?;
                        }
                        Some(Command::Poke) => {
                            self.make_requests(&mut sink).await?;
                        }
                        Some(Command::SetChoke(choking)) => {
                            if choking {
                                sink.send(Message::Choke).await?;
                            } else {
                                sink.send(Message::Unchoke).await?;
                            }
                        }
                    }
                }
                _ = keepalive_timer.tick() => {
                    sink.send(Message::KeepAlive).await?;
                }
            }
        }

        Ok(())
    }

    async fn handle_bitfield(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        raw_bitfield: Bitfield,
    ) -> Result<()> {
        let piece_count = self.torrent.storage.piece_count;
        let expected_bytes = bitfield::wire_byte_len(piece_count);
        let actual_bytes = (raw_bitfield.len() + 7) / 8;
        if actual_bytes != expected_bytes {
            return Err(Error::InvalidBitfieldLength {
                expected: expected_bytes,
                actual: actual_bytes,
            });
        }

        let mut bitfield = raw_bitfield;
        bitfield.resize(piece_count, false);
        *self.shared.remote_bitfield.write().await = bitfield.clone();

        self.recompute_interest(sink, &bitfield).await
    }

    async fn recompute_interest(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        remote_bitfield: &Bitfield,
    ) -> Result<()> {
        let local_bitfield = self.torrent.local_bitfield.read().await;
        let has_needed_piece = remote_bitfield
            .iter()
            .enumerate()
            .any(|(i, has)| *has && !*local_bitfield.get(i).unwrap_or(&true));
        drop(local_bitfield);

        let was_interested = self.shared.am_interested.swap(has_needed_piece, Ordering::SeqCst);
        if has_needed_piece && !was_interested {
            sink.send(Message::Interested).await?;
        } else if !has_needed_piece && was_interested {
            sink.send(Message::NotInterested).await?;
        }
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {}
            Message::Choke => {
                self.shared.peer_choking.store(true, Ordering::SeqCst);
                self.outgoing_requests.clear();
            }
            Message::Unchoke => {
                self.shared.peer_choking.store(false, Ordering::SeqCst);
                self.make_requests(sink).await?;
            }
            Message::Interested => {
                self.shared.peer_interested.store(true, Ordering::SeqCst);
            }
            Message::NotInterested => {
                self.shared.peer_interested.store(false, Ordering::SeqCst);
            }
            Message::Have { piece_index } => {
                let piece_index = piece_index as usize;
                if piece_index < self.torrent.storage.piece_count {
                    self.shared.remote_bitfield.write().await.set(piece_index, true);
                    let remote_bitfield = self.shared.remote_bitfield.read().await.clone();
                    self.recompute_interest(sink, &remote_bitfield).await?;
                } else {
                    log::debug!("peer {} sent have for out of range index {}", self.addr, piece_index);
                }
            }
            Message::Request(block) => {
                self.serve_request(sink, block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block(block, data).await?;
                self.make_requests(sink).await?;
            }
            Message::Cancel(_) => {
                // no explicit cancellation bookkeeping; the remote's
                // request, if already served, was already sent
            }
        }
        Ok(())
    }

    /// Honors an incoming block request if we're not choking the peer.
    async fn serve_request(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        block: BlockInfo,
    ) -> Result<()> {
        if self.shared.am_choking.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.store.retrieve(block.piece_index, block.offset, block.len).await {
            Ok(data) => {
                sink.send(Message::Block {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                })
                .await?;
            }
            Err(Error::UnverifiedRead(_)) | Err(Error::OutOfRange { .. }) => {
                // silently skip: unverified piece, or a request whose
                // begin+length overruns the piece
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Requests blocks for whatever piece the scheduler has assigned to
    /// us, if any and if we're allowed to.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.shared.peer_choking.load(Ordering::SeqCst)
            || !self.shared.am_interested.load(Ordering::SeqCst)
        {
            return Ok(());
        }

        if !self.outgoing_requests.is_empty() {
            return Ok(());
        }

        let assigned_index = {
            let picker = self.piece_picker.read().await;
            (0..self.torrent.storage.piece_count).find(|&i| {
                let entry = picker.entry(i);
                entry.assigned_peer == Some(self.self_handle)
                    && entry.status == crate::piece_picker::PieceStatus::InFlight
            })
        };

        let index = match assigned_index {
            Some(index) => index,
            None => match self.assign_new_piece().await? {
                Some(index) => index,
                None => return Ok(()),
            },
        };

        self.download_start = Some(Instant::now());
        let pending = self.piece_picker.read().await.entry(index).pending_blocks.clone();
        for &(offset, len) in &pending {
            let block = BlockInfo {
                piece_index: index,
                offset,
                len,
            };
            sink.send(Message::Request(block)).await?;
            self.outgoing_requests.push(block);
        }

        Ok(())
    }

    async fn assign_new_piece(&mut self) -> Result<Option<PieceIndex>> {
        let remote_bitfield = self.shared.remote_bitfield.read().await.clone();
        let mut picker = self.piece_picker.write().await;
        if picker.outstanding_count() >= self.torrent.conf.scheduler.max_outstanding_pieces {
            return Ok(None);
        }
        let index = match picker.pick_idle_piece(&remote_bitfield) {
            Some(index) => index,
            None => return Ok(None),
        };
        let piece_len = self.torrent.storage.piece_len(index)?;
        let blocks = free_blocks_for_new_piece(piece_len);
        picker.assign(
            index,
            self.self_handle,
            blocks,
            self.torrent.conf.scheduler.piece_expiry,
            Instant::now(),
        );
        Ok(Some(index))
    }

    async fn handle_block(&mut self, block: BlockInfo, data: Vec<u8>) -> Result<()> {
        let pos = match self.outgoing_requests.iter().position(|b| *b == block) {
            Some(pos) => pos,
            None => {
                log::debug!("peer {} sent unrequested block {:?}", self.addr, block);
                return Ok(());
            }
        };
        self.outgoing_requests.remove(pos);

        let became_verified = self.store.store(block.piece_index, block.offset, data).await?;

        let mut picker = self.piece_picker.write().await;
        let piece_done = picker.remove_pending_block(block.piece_index, block.offset, block.len);

        if became_verified {
            picker.mark_verified(block.piece_index);
            drop(picker);
            self.torrent.local_bitfield.write().await.set(block.piece_index, true);

            if let Some(start) = self.download_start.take() {
                let elapsed = start.elapsed().as_secs().max(1);
                let piece_len = self.torrent.storage.piece_len(block.piece_index)?;
                let sample = piece_len as u64 / elapsed;
                let avg = {
                    let mut samples = self.shared.download_samples.lock().unwrap();
                    samples.update(sample);
                    samples.avg()
                };
                self.shared.download_rate.store(avg, Ordering::SeqCst);
            }

            let _ = self.alert_chan.send(Alert::PieceVerified(block.piece_index));
        } else if piece_done {
            // all blocks arrived but the hash didn't match; scheduler
            // entry already reset to empty by the piece store, make it
            // available again
            picker.mark_idle(block.piece_index);
        }

        Ok(())
    }
}

/// Computes the list of (offset, length) blocks covering a freshly assigned
/// piece, clamping the final block to the piece's actual remaining length
/// (per DESIGN NOTES: don't overrequest on the short final piece).
fn free_blocks_for_new_piece(piece_len: u32) -> Vec<(u32, u32)> {
    let count = crate::block_count(piece_len);
    (0..count)
        .map(|i| {
            let offset = i as u32 * crate::BLOCK_LEN;
            (offset, crate::block_len(piece_len, i))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_blocks_clamp_final_short_block() {
        let blocks = free_blocks_for_new_piece(40000);
        assert_eq!(blocks, vec![(0, 16384), (16384, 16384), (32768, 7232)]);
    }
}
