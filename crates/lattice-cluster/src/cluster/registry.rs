//! Per-member link state.

use std::net::SocketAddr;

use crate::framer::{derive_link_key, FrameQueue, LinkKey};
use crate::geo::GeoPoint;
use crate::identity::MASTER_SECRET_LEN;
use crate::wire::MemberId;

/// Everything tracked for one (potential) cluster member.
///
/// A slot exists for every id in the id space but only carries meaning
/// while its id is in the live member set; admission re-derives the link
/// key and opens a fresh frame queue, so nothing from a previous tenancy
/// of the slot leaks into the next.
pub(crate) struct MemberState {
    /// Link key the member's inbound frames are sealed with.
    pub key: LinkKey,
    /// Batched outbound queue toward the member.
    pub queue: FrameQueue,
    /// Advertised location; all-zero until an ALIVE carries one.
    pub location: GeoPoint,
    /// Advertised load; transmitted but unused by decisions.
    pub load: u64,
    /// Advertised physical endpoints, in preference order.
    pub endpoints: Vec<SocketAddr>,
    /// When the most recent ALIVE arrived from this member.
    pub last_received_alive: u64,
    /// When we last queued an ALIVE toward this member.
    pub last_announced_alive_to: u64,
}

impl MemberState {
    /// An empty slot outside the live set.
    pub fn vacant() -> Self {
        Self {
            key: LinkKey::vacant(),
            queue: FrameQueue::closed(),
            location: GeoPoint::UNKNOWN,
            load: 0,
            endpoints: Vec::new(),
            last_received_alive: 0,
            last_announced_alive_to: 0,
        }
    }

    /// A freshly admitted member: derived link key, open queue, zeroed
    /// state.
    pub fn admitted(
        master_secret: &[u8; MASTER_SECRET_LEN],
        local_id: MemberId,
        member: MemberId,
    ) -> Self {
        Self {
            key: derive_link_key(master_secret, member),
            queue: FrameQueue::open(local_id, member),
            ..Self::vacant()
        }
    }

    /// Whether the member's heartbeat is within `timeout` of `now`.
    pub fn is_alive(&self, now: u64, timeout: u64) -> bool {
        now.saturating_sub(self.last_received_alive) < timeout
    }
}
