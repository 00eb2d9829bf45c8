//! The request scheduler's per-piece bookkeeping: which pieces are idle,
//! in flight, or verified, who they're assigned to, and which blocks of an
//! in-flight piece are still outstanding.

use std::time::{Duration, Instant};

use crate::{Bitfield, PieceIndex};

/// One piece's scheduling state, kept by the `PeerManager`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PieceStatus {
    Idle,
    InFlight,
    Verified,
}

/// The peer-connection identity a piece is currently assigned to. Peers are
/// referenced by index into `PeerManager`'s connection table rather than by
/// a direct reference, to avoid the reference cycles the original design
/// used classes for.
pub type PeerHandle = usize;

#[derive(Clone, Debug)]
pub struct PieceSchedulerEntry {
    pub status: PieceStatus,
    pub assigned_peer: Option<PeerHandle>,
    /// Still-missing `(offset, length)` blocks for this piece.
    pub pending_blocks: Vec<(u32, u32)>,
    pub start_time: Option<Instant>,
    pub expire_time: Option<Instant>,
}

impl PieceSchedulerEntry {
    fn idle() -> Self {
        Self {
            status: PieceStatus::Idle,
            assigned_peer: None,
            pending_blocks: Vec::new(),
            start_time: None,
            expire_time: None,
        }
    }
}

/// Owns one [`PieceSchedulerEntry`] per piece and implements idle-piece
/// selection and expiry.
pub struct PiecePicker {
    entries: Vec<PieceSchedulerEntry>,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            entries: (0..piece_count).map(|_| PieceSchedulerEntry::idle()).collect(),
        }
    }

    pub fn entry(&self, index: PieceIndex) -> &PieceSchedulerEntry {
        &self.entries[index]
    }

    pub fn mark_verified(&mut self, index: PieceIndex) {
        self.entries[index] = PieceSchedulerEntry {
            status: PieceStatus::Verified,
            ..PieceSchedulerEntry::idle()
        };
    }

    /// Resets a piece to idle, e.g. after a failed verification or an
    /// expired request.
    pub fn mark_idle(&mut self, index: PieceIndex) {
        self.entries[index] = PieceSchedulerEntry::idle();
    }

    /// Assigns `index` to `peer`, in flight, with the given pending blocks
    /// and expiry.
    pub fn assign(
        &mut self,
        index: PieceIndex,
        peer: PeerHandle,
        pending_blocks: Vec<(u32, u32)>,
        expiry: Duration,
        now: Instant,
    ) {
        self.entries[index] = PieceSchedulerEntry {
            status: PieceStatus::InFlight,
            assigned_peer: Some(peer),
            pending_blocks,
            start_time: Some(now),
            expire_time: Some(now + expiry),
        };
    }

    /// Removes a completed block from the pending set of an in-flight
    /// piece. Returns true if that was the piece's last pending block.
    pub fn remove_pending_block(&mut self, index: PieceIndex, offset: u32, len: u32) -> bool {
        let entry = &mut self.entries[index];
        entry.pending_blocks.retain(|&(o, l)| !(o == offset && l == len));
        entry.pending_blocks.is_empty()
    }

    /// Resets every in-flight entry whose expiry has passed back to idle,
    /// returning the indices that were reset.
    pub fn cancel_expired(&mut self, now: Instant) -> Vec<PieceIndex> {
        let mut expired = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.status == PieceStatus::InFlight {
                if let Some(expire_time) = entry.expire_time {
                    if now >= expire_time {
                        expired.push(index);
                        *entry = PieceSchedulerEntry::idle();
                    }
                }
            }
        }
        expired
    }

    /// Uniform-random choice among idle pieces the peer has, per
    /// `remote_bitfield[i] == 1 AND scheduler[i].status == idle`.
    pub fn pick_idle_piece(&self, remote_bitfield: &Bitfield) -> Option<PieceIndex> {
        let candidates: Vec<PieceIndex> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(index, entry)| {
                entry.status == PieceStatus::Idle
                    && remote_bitfield.get(*index).map(|b| *b).unwrap_or(false)
            })
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = rand::random::<usize>() % candidates.len();
        Some(candidates[pick])
    }

    pub fn outstanding_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == PieceStatus::InFlight)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_idle_piece_only_considers_idle_and_available() {
        let mut picker = PiecePicker::new(4);
        picker.assign(1, 0, vec![], Duration::from_secs(5), Instant::now());
        picker.mark_verified(2);

        let mut bitfield = Bitfield::repeat(false, 4);
        bitfield.set(0, true);
        bitfield.set(1, true);
        bitfield.set(2, true);
        bitfield.set(3, false);

        // only piece 0 is both idle and available; 1 is in flight, 2 is
        // verified, 3 is not available
        assert_eq!(picker.pick_idle_piece(&bitfield), Some(0));
    }

    #[test]
    fn cancel_expired_resets_only_past_deadline_entries() {
        let mut picker = PiecePicker::new(2);
        let now = Instant::now();
        picker.assign(0, 0, vec![], Duration::from_secs(0), now - Duration::from_secs(1));
        picker.assign(1, 1, vec![], Duration::from_secs(60), now);

        let expired = picker.cancel_expired(now);
        assert_eq!(expired, vec![0]);
        assert_eq!(picker.entry(0).status, PieceStatus::Idle);
        assert_eq!(picker.entry(1).status, PieceStatus::InFlight);
    }

    #[test]
    fn remove_pending_block_reports_when_piece_is_done() {
        let mut picker = PiecePicker::new(1);
        picker.assign(
            0,
            0,
            vec![(0, 16384), (16384, 16384)],
            Duration::from_secs(5),
            Instant::now(),
        );
        assert!(!picker.remove_pending_block(0, 0, 16384));
        assert!(picker.remove_pending_block(0, 16384, 16384));
    }
}
