//! Replicated peer-affinity table.
//!
//! Maps each overlay peer to the member that most recently claimed a
//! direct path to it, with the claim timestamp. Remote claims (HAVE_PEER)
//! always win; local claims are debounced so steady traffic does not turn
//! into a broadcast storm.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::wire::{MemberId, PeerAddress};

use super::{HAVE_PEER_ANNOUNCE_INTERVAL, PEER_ACTIVITY_TIMEOUT};

/// How many activity-timeout periods an entry may age before the sweeper
/// erases it.
const SWEEP_FACTOR: u64 = 5;

#[derive(Debug, Clone, Copy)]
struct AffinityEntry {
    owner: MemberId,
    updated_at: u64,
}

/// The affinity table. Interior mutex; safe to share by reference.
pub(crate) struct AffinityMap {
    entries: Mutex<HashMap<PeerAddress, AffinityEntry>>,
}

impl AffinityMap {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerAddress, AffinityEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The member to relay traffic for `peer` through: present, not us,
    /// and refreshed within the activity timeout.
    pub fn owner_for(&self, peer: PeerAddress, local_id: MemberId, now: u64) -> Option<MemberId> {
        let entries = self.lock();
        let entry = entries.get(&peer)?;
        if entry.owner == local_id
            || now.saturating_sub(entry.updated_at) >= PEER_ACTIVITY_TIMEOUT
        {
            return None;
        }
        Some(entry.owner)
    }

    /// Applies a remote HAVE_PEER claim: the sender becomes the owner
    /// unconditionally.
    pub fn record_remote(&self, peer: PeerAddress, owner: MemberId, now: u64) {
        self.lock().insert(
            peer,
            AffinityEntry {
                owner,
                updated_at: now,
            },
        );
    }

    /// Applies a local ownership observation and reports whether it
    /// should be announced to the cluster.
    ///
    /// Taking ownership away from another member always announces;
    /// refreshing our own claim announces at most once per
    /// [`HAVE_PEER_ANNOUNCE_INTERVAL`].
    pub fn claim_local(&self, peer: PeerAddress, local_id: MemberId, now: u64) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&peer) {
            Some(entry) if entry.owner != local_id => {
                entry.owner = local_id;
                entry.updated_at = now;
                true
            }
            Some(entry) => {
                if now.saturating_sub(entry.updated_at) < HAVE_PEER_ANNOUNCE_INTERVAL {
                    return false;
                }
                entry.updated_at = now;
                true
            }
            None => {
                entries.insert(
                    peer,
                    AffinityEntry {
                        owner: local_id,
                        updated_at: now,
                    },
                );
                true
            }
        }
    }

    /// Erases entries older than five activity timeouts. Bounds table
    /// size; staleness for relay decisions is handled in `owner_for`.
    pub fn sweep(&self, now: u64) {
        let horizon = SWEEP_FACTOR * PEER_ACTIVITY_TIMEOUT;
        self.lock()
            .retain(|_, entry| now.saturating_sub(entry.updated_at) < horizon);
    }

    /// Milliseconds until a sweep is due again, measured from the last
    /// sweep; the sweep cadence equals the erase horizon.
    pub fn sweep_interval() -> u64 {
        SWEEP_FACTOR * PEER_ACTIVITY_TIMEOUT
    }

    /// Counts fresh entries per owning member, excluding the local id,
    /// for the status surface.
    pub fn fresh_owner_counts(&self, local_id: MemberId, now: u64) -> HashMap<MemberId, usize> {
        let entries = self.lock();
        let mut counts = HashMap::new();
        for entry in entries.values() {
            if entry.owner != local_id
                && now.saturating_sub(entry.updated_at) < PEER_ACTIVITY_TIMEOUT
            {
                *counts.entry(entry.owner).or_insert(0) += 1;
            }
        }
        counts
    }

    #[cfg(test)]
    fn updated_at(&self, peer: PeerAddress) -> Option<u64> {
        self.lock().get(&peer).map(|entry| entry.updated_at)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}
