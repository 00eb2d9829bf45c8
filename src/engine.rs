//! The top-level session: multiplexes the listening socket, stdin
//! commands, and the periodic tracker timer, wiring the tracker client,
//! piece store, and swarm core together.

use std::{
    net::SocketAddr,
    path::Path,
    sync::Arc,
};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    time,
};

use crate::{
    conf::Conf,
    error::*,
    metainfo::Metainfo,
    piece_store::PieceStoreHandle,
    storage_info::StorageInfo,
    tracker::{AnnounceRequest, Event, TrackerClient},
    torrent::{format_status_line, Torrent},
    Bitfield,
};

/// Runs a single torrent end to end: loads the metainfo, opens the piece
/// store, and drives the event loop until `exit` is read from stdin or a
/// fatal error occurs.
pub async fn run(torrent_path: &Path, port: u16, conf: Conf) -> Result<()> {
    let bytes = std::fs::read(torrent_path)?;
    let metainfo = Metainfo::from_bytes(&bytes)
        .map_err(|e| Error::InvalidTorrentFile(e.to_string()))?;
    let info_hash = metainfo
        .create_info_hash()
        .map_err(|e| Error::InvalidTorrentFile(e.to_string()))?;

    let storage = StorageInfo::new(&metainfo, conf.torrent.download_dir.clone());
    let piece_count = storage.piece_count;
    let piece_hashes = split_piece_hashes(metainfo.piece_hashes())?;

    log::info!(
        "starting torrent {} ({} pieces, info hash {})",
        metainfo.name,
        piece_count,
        hex::encode(&info_hash)
    );

    let store = PieceStoreHandle::spawn(storage.clone(), piece_hashes).await?;
    let (verified, total, _) = store.status().await?;
    log::info!("startup scan: {}/{} pieces already verified", verified, total);

    let local_bitfield = initial_bitfield(&store, piece_count).await?;

    let piece_len = storage.piece_len;
    let last_piece_len = storage.last_piece_len;
    let download_len = storage.download_len;

    let mut torrent = Torrent::new(
        info_hash,
        conf.engine.client_id,
        storage,
        conf.clone(),
        store.clone(),
        local_bitfield,
    );

    let mut tracker = TrackerClient::new(metainfo.announce.clone(), metainfo.announce_list.clone());

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("listening on port {}", port);

    let mut announce_timer = time::interval(conf.torrent.announce_interval);
    let mut tick_timer = time::interval(conf.scheduler.choke_interval);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        log::info!("accepted inbound connection from {}", addr);
                        torrent.accept_inbound(addr, socket);
                    }
                    Err(e) => log::warn!("accept failed: {}", e),
                }
            }
            line = stdin.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_console_line(&line, &mut torrent).await {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            _ = announce_timer.tick() => {
                let (_, _, missing) = store.status().await?;
                // per DESIGN NOTES: left is total size minus verified bytes,
                // not `piece_length * piece_count` as one tracker variant in
                // the source computes it
                let left: u64 = missing
                    .iter()
                    .map(|&i| if i + 1 == piece_count { last_piece_len as u64 } else { piece_len as u64 })
                    .sum();
                debug_assert!(left <= download_len);
                let request = AnnounceRequest {
                    info_hash,
                    peer_id: conf.engine.client_id,
                    port,
                    uploaded: 0,
                    downloaded: 0,
                    left,
                    event: Event::Periodic,
                };
                match tracker.announce(&request).await {
                    Ok(response) => {
                        log::info!("announce returned {} peers", response.peers.len());
                        for peer in response.peers {
                            torrent.connect_outbound(SocketAddr::V4(peer.addr));
                        }
                    }
                    Err(e) => log::warn!("announce failed: {}", e),
                }
            }
            _ = tick_timer.tick() => {
                torrent.tick().await;
            }
        }
    }

    torrent.shutdown();
    Ok(())
}

async fn handle_console_line(line: &str, torrent: &mut Torrent) -> bool {
    let mut parts = line.trim().split_whitespace();
    match parts.next() {
        Some("exit") => false,
        Some("print") => {
            let status = torrent.local_bitfield_snapshot();
            let bitfield = status.local_bitfield.read().await.clone();
            println!("{}", format_status_line(&bitfield, torrent.connection_count()));
            true
        }
        Some("peer") => {
            // `peer <id> <ip> <port>`; the id is informational only and
            // isn't needed to dial the peer, so it's consumed and dropped.
            let _id = parts.next();
            let (ip, port) = (parts.next(), parts.next());
            if let (Some(ip), Some(port)) = (ip, port) {
                if let Ok(port) = port.parse::<u16>() {
                    if let Ok(ip) = ip.parse() {
                        torrent.connect_outbound(SocketAddr::new(ip, port));
                    }
                }
            }
            true
        }
        _ => true,
    }
}

async fn initial_bitfield(store: &PieceStoreHandle, piece_count: usize) -> Result<Bitfield> {
    let (_, _, missing) = store.status().await?;
    let mut bitfield = crate::bitfield::empty(piece_count);
    for i in 0..piece_count {
        if !missing.contains(&i) {
            bitfield.set(i, true);
        }
    }
    Ok(bitfield)
}

fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<crate::Sha1Hash>> {
    if pieces.len() % 20 != 0 {
        return Err(Error::InvalidTorrentFile("pieces field length not a multiple of 20".into()));
    }
    Ok(pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_piece_hashes_rejects_uneven_length() {
        let pieces = vec![0u8; 25];
        assert!(split_piece_hashes(&pieces).is_err());
    }

    #[test]
    fn split_piece_hashes_splits_into_20_byte_chunks() {
        let pieces = vec![0u8; 40];
        let hashes = split_piece_hashes(&pieces).unwrap();
        assert_eq!(hashes.len(), 2);
    }
}
