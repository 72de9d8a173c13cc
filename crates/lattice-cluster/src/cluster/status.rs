//! Read-only cluster status snapshot.

use std::net::SocketAddr;

use serde::Serialize;

use crate::wire::MemberId;

/// Point-in-time view of one member, local or remote.
#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    /// The member's id.
    pub id: MemberId,
    /// Whether the member is within the heartbeat timeout (always `true`
    /// for the local entry).
    pub alive: bool,
    /// Milliseconds since the last ALIVE (zero for the local entry).
    pub ms_since_heartbeat: u64,
    /// Advertised X coordinate.
    pub x: i32,
    /// Advertised Y coordinate.
    pub y: i32,
    /// Advertised Z coordinate.
    pub z: i32,
    /// Advertised load.
    pub load: u64,
    /// Advertised physical endpoints.
    pub endpoints: Vec<SocketAddr>,
    /// Peers attributed to this member: the live topology count for the
    /// local entry, fresh affinity entries for remote ones.
    pub peer_count: usize,
}

/// Point-in-time view of the whole cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    /// The local member id.
    pub my_id: MemberId,
    /// Number of members in the snapshot (including the local one).
    pub cluster_size: usize,
    /// Per-member records; the local member is first.
    pub members: Vec<MemberStatus>,
}
