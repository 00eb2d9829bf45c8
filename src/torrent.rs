//! The swarm core: owns the set of peer connections, drives the request
//! scheduler and choke algorithm, propagates `have`, and expires idle
//! peers.
//!
//! Cyclic references (`PeerManager` <-> `PeerConnection` <-> scheduler
//! entries) are resolved the way the spec's DESIGN NOTES suggest: peers are
//! referenced by an integer handle (their index in the connection table)
//! rather than by pointer, and the connection table itself is the only
//! piece of state touched from outside the main loop (by the background
//! connect tasks), guarded by a mutex.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc, Mutex},
};

use tokio::{
    net::TcpStream,
    sync::{mpsc, RwLock},
};

use crate::{
    conf::Conf,
    error::*,
    peer::{Alert as PeerAlert, Command as PeerCommand, PeerSession, PeerShared, Sender as PeerCommandSender},
    piece_picker::PiecePicker,
    piece_store::PieceStoreHandle,
    storage_info::StorageInfo,
    Bitfield, PeerId, Sha1Hash,
};

/// Immutable-ish state about a torrent shared by every peer session and the
/// swarm core. Replaces the source's class-body globals with an explicit,
/// arena-like struct threaded through every subsystem.
pub struct SharedStatus {
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub conf: Conf,
    pub local_bitfield: RwLock<Bitfield>,
}

struct PeerEntry {
    shared: Arc<PeerShared>,
    cmd_chan: PeerCommandSender,
}

/// The swarm manager for a single torrent.
pub struct Torrent {
    status: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    store: PieceStoreHandle,
    connections: Arc<Mutex<HashMap<usize, PeerEntry>>>,
    next_handle: usize,
    alert_chan: mpsc::UnboundedSender<PeerAlert>,
    alert_port: mpsc::UnboundedReceiver<PeerAlert>,
}

impl Torrent {
    pub fn new(
        info_hash: Sha1Hash,
        client_id: PeerId,
        storage: StorageInfo,
        conf: Conf,
        store: PieceStoreHandle,
        local_bitfield: Bitfield,
    ) -> Self {
        let piece_count = storage.piece_count;
        let status = Arc::new(SharedStatus {
            info_hash,
            client_id,
            storage,
            conf,
            local_bitfield: RwLock::new(local_bitfield),
        });
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        Self {
            status,
            piece_picker: Arc::new(RwLock::new(PiecePicker::new(piece_count))),
            store,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_handle: 0,
            alert_chan,
            alert_port,
        }
    }

    pub async fn is_complete(&self) -> Result<bool> {
        let (verified, total, _) = self.store.status().await?;
        Ok(verified == total)
    }

    /// Connects to a newly discovered peer in the background; on success the
    /// resulting session is registered in the connection table under a
    /// mutex, the only mutation background workers are permitted to make.
    pub fn connect_outbound(&mut self, addr: SocketAddr) -> usize {
        let handle = self.next_handle;
        self.next_handle += 1;

        let shared = Arc::new(PeerShared::default());
        let (session, cmd_chan) = PeerSession::new(
            Arc::clone(&self.status),
            Arc::clone(&self.piece_picker),
            self.store.clone(),
            Arc::clone(&shared),
            handle,
            self.alert_chan.clone(),
            addr,
        );

        self.connections.lock().unwrap().insert(
            handle,
            PeerEntry {
                shared,
                cmd_chan,
            },
        );

        let mut session = session;
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            if let Err(e) = session.run_outbound().await {
                log::debug!("outbound session with {} ended: {}", addr, e);
            }
            connections.lock().unwrap().remove(&handle);
        });

        handle
    }

    /// Registers an already-accepted inbound TCP stream.
    pub fn accept_inbound(&mut self, addr: SocketAddr, socket: TcpStream) -> usize {
        let handle = self.next_handle;
        self.next_handle += 1;

        let shared = Arc::new(PeerShared::default());
        let (mut session, cmd_chan) = PeerSession::new(
            Arc::clone(&self.status),
            Arc::clone(&self.piece_picker),
            self.store.clone(),
            Arc::clone(&shared),
            handle,
            self.alert_chan.clone(),
            addr,
        );

        self.connections.lock().unwrap().insert(handle, PeerEntry { shared, cmd_chan });

        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            if let Err(e) = session.run_inbound(socket).await {
                log::debug!("inbound session with {} ended: {}", addr, e);
            }
            connections.lock().unwrap().remove(&handle);
        });

        handle
    }

    /// Drains pending alerts from peer sessions (piece completions,
    /// disconnects) and reacts to them: broadcasting `have`, for instance.
    pub async fn drain_alerts(&mut self) {
        while let Ok(alert) = self.alert_port.try_recv() {
            match alert {
                PeerAlert::PieceVerified(index) => {
                    self.broadcast_have(index);
                }
                PeerAlert::Disconnected => {}
            }
        }
    }

    fn broadcast_have(&self, index: crate::PieceIndex) {
        let connections = self.connections.lock().unwrap();
        for entry in connections.values() {
            if entry.shared.ready.load(Ordering::SeqCst) {
                let _ = entry.cmd_chan.send(PeerCommand::Have(index));
            }
        }
    }

    /// Runs one scheduler tick: `cancel_expired`, `choking`, `make_requests`
    /// (per spec §4.4). Intended to be invoked on the `choke_interval`
    /// timer.
    pub async fn tick(&mut self) {
        self.drain_alerts().await;

        let expired = self.piece_picker.write().await.cancel_expired(std::time::Instant::now());
        if !expired.is_empty() {
            log::debug!("expired pieces reassigned: {:?}", expired);
        }

        self.run_choke_algorithm();

        // poke every peer so that any now-idle, unchoked, interested peer
        // picks up newly freed or newly available work
        let connections = self.connections.lock().unwrap();
        for entry in connections.values() {
            let _ = entry.cmd_chan.send(PeerCommand::Poke);
        }
    }

    /// Implements the spec's unchoke selection policy exactly as written:
    /// among interested peers, repeatedly unchoke the one with the
    /// **lowest** download rate not yet unchoked, up to `max_downloaders`.
    /// This is recorded by the spec as a probable bug versus BEP-3's
    /// tit-for-tat (which picks the fastest), but is the contract to
    /// implement.
    fn run_choke_algorithm(&self) {
        let connections = self.connections.lock().unwrap();
        let max_downloaders = self.status.conf.scheduler.max_downloaders;

        let mut candidates: Vec<_> = connections
            .iter()
            .filter(|(_, entry)| entry.shared.peer_interested.load(Ordering::SeqCst))
            .map(|(handle, entry)| {
                (*handle, entry.shared.download_rate.load(Ordering::SeqCst))
            })
            .collect();
        candidates.sort_by_key(|(_, rate)| *rate);

        let unchoke_set: std::collections::HashSet<usize> =
            candidates.into_iter().take(max_downloaders).map(|(h, _)| h).collect();

        for (handle, entry) in connections.iter() {
            // peers that dropped interest are filtered out of `candidates`
            // above and so never make it into `unchoke_set`.
            let should_choke = !unchoke_set.contains(handle);
            let was_choking = entry.shared.am_choking.swap(should_choke, Ordering::SeqCst);
            if was_choking != should_choke {
                log::trace!("peer {} choke state changed to choking={}", handle, should_choke);
                let _ = entry.cmd_chan.send(PeerCommand::SetChoke(should_choke));
            }
        }
    }

    pub fn local_bitfield_snapshot(&self) -> Arc<SharedStatus> {
        Arc::clone(&self.status)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn shutdown(&self) {
        let connections = self.connections.lock().unwrap();
        for entry in connections.values() {
            let _ = entry.cmd_chan.send(PeerCommand::Shutdown);
        }
    }
}

/// Summarizes a torrent's current availability for the `print` console
/// command (spec §4.6).
pub fn format_status_line(bitfield: &Bitfield, peer_count: usize) -> String {
    let have = bitfield.count_ones();
    let total = bitfield.len();
    format!("pieces: {}/{}, peers: {}", have, total, peer_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_reports_piece_and_peer_counts() {
        let mut bitfield = Bitfield::repeat(false, 4);
        bitfield.set(0, true);
        bitfield.set(1, true);
        assert_eq!(format_status_line(&bitfield, 3), "pieces: 2/4, peers: 3");
    }
}
