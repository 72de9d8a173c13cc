//! The cluster coordination core.
//!
//! A [`Cluster`] lets up to [`MAX_MEMBERS`] nodes present themselves to
//! the overlay as one logical endpoint. It maintains the member registry
//! and per-link frame queues, replicates the peer-affinity table, relays
//! peer packets toward owning members, orchestrates proxied NAT-traversal
//! rendezvous, answers geo-redirect queries, and runs the periodic
//! heartbeat/flush/GC loop.
//!
//! Every public operation may be called from any thread. Three lock
//! classes exist (the member-id set, one mutex per member slot, and the
//! affinity table) and are always acquired in that order; no operation
//! holds two member slots at once.

mod affinity;
mod registry;
mod status;

pub use status::{ClusterStatus, MemberStatus};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use crate::framer::{
    self, derive_link_key, LinkKey, FRAME_HEADER_LEN, MAX_MESSAGE_LEN, SUB_MESSAGE_OVERHEAD,
};
use crate::geo::GeoPoint;
use crate::host::{ClusterHost, OverlayPacket, VERB_RENDEZVOUS};
use crate::identity::{NodeIdentity, PeerIdentity, MASTER_SECRET_LEN};
use crate::protocol::{
    AliveInfo, MessageKind, MulticastGroup, StateMessage, PROTOCOL_VERSION, VERSION_MAJOR,
    VERSION_MINOR, VERSION_REVISION,
};
use crate::wire::{MemberId, PeerAddress};

use affinity::AffinityMap;
use registry::MemberState;

/// Size of the member id space; ids are `0..MAX_MEMBERS`.
pub const MAX_MEMBERS: usize = 128;

/// A member whose last ALIVE is older than this is considered dead.
pub const MEMBER_ALIVE_TIMEOUT: u64 = 30_000;

/// How often the periodic loop seals and sends pending frames.
pub const FLUSH_INTERVAL: u64 = 500;

/// Minimum spacing between HAVE_PEER announcements for one peer.
pub const HAVE_PEER_ANNOUNCE_INTERVAL: u64 = 60_000;

/// An affinity entry older than this no longer attracts relayed traffic.
pub const PEER_ACTIVITY_TIMEOUT: u64 = 300_000;

/// Queue an ALIVE toward a member when the last one is older than this;
/// kept under half the alive timeout so one lost heartbeat is survivable.
const ALIVE_ANNOUNCE_INTERVAL: u64 = MEMBER_ALIVE_TIMEOUT / 2 - 1_000;

/// Baseline distance used when offloading: any live located member wins.
const OFFLOAD_BASELINE: f64 = 2_147_483_648.0;

/// Construction-time parameters for the local member.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// The local member id; must be below [`MAX_MEMBERS`].
    pub local_id: MemberId,
    /// The local node's coordinates. `None` means no geolocation oracle
    /// is deployed: ALIVE advertises zeros and redirect queries always
    /// decline.
    pub location: Option<GeoPoint>,
    /// The local node's physical endpoints, advertised in ALIVE.
    pub endpoints: Vec<SocketAddr>,
}

/// Errors rejecting a [`ClusterConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClusterConfigError {
    /// The configured local id does not fit the member id space.
    #[error("member id {id} is outside the cluster id space")]
    MemberIdOutOfRange {
        /// The offending id.
        id: MemberId,
    },
}

/// The cluster coordination core. See the [module docs](self).
pub struct Cluster<H: ClusterHost> {
    host: H,
    local_id: MemberId,
    identity_address: PeerAddress,
    location: Option<GeoPoint>,
    endpoints: Vec<SocketAddr>,
    master_secret: Zeroizing<[u8; MASTER_SECRET_LEN]>,
    /// Our own link key; inbound frames from every member are sealed
    /// with it.
    inbound_key: LinkKey,
    members: Box<[Mutex<MemberState>]>,
    member_ids: Mutex<Vec<MemberId>>,
    affinity: AffinityMap,
    last_affinity_sweep: AtomicU64,
    last_announce_check: AtomicU64,
    last_flush: AtomicU64,
}

impl<H: ClusterHost> Cluster<H> {
    /// Builds the core for one member of a cluster.
    ///
    /// All members must be constructed from the same overlay identity;
    /// the master secret every link key derives from is a SHA-512 digest
    /// of its private key material.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterConfigError::MemberIdOutOfRange`] when
    /// `config.local_id` is not below [`MAX_MEMBERS`].
    pub fn new(
        host: H,
        identity: &NodeIdentity,
        config: ClusterConfig,
    ) -> Result<Self, ClusterConfigError> {
        if usize::from(config.local_id) >= MAX_MEMBERS {
            return Err(ClusterConfigError::MemberIdOutOfRange {
                id: config.local_id,
            });
        }

        let master_secret = identity.master_secret();
        let inbound_key = derive_link_key(&master_secret, config.local_id);
        let members = (0..MAX_MEMBERS)
            .map(|_| Mutex::new(MemberState::vacant()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            host,
            local_id: config.local_id,
            identity_address: identity.address(),
            location: config.location,
            endpoints: config.endpoints,
            master_secret,
            inbound_key,
            members,
            member_ids: Mutex::new(Vec::new()),
            affinity: AffinityMap::new(),
            last_affinity_sweep: AtomicU64::new(0),
            last_announce_check: AtomicU64::new(0),
            last_flush: AtomicU64::new(0),
        })
    }

    /// The local member id.
    #[must_use]
    pub fn local_id(&self) -> MemberId {
        self.local_id
    }

    fn lock_ids(&self) -> MutexGuard<'_, Vec<MemberId>> {
        self.member_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_member(&self, member: MemberId) -> MutexGuard<'_, MemberState> {
        self.members[usize::from(member)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Membership administration
    // ------------------------------------------------------------------

    /// Admits a member to the cluster.
    ///
    /// Out-of-range ids, the local id, and already-present ids are
    /// silent no-ops. Admission wipes whatever a previous tenant of the
    /// slot left behind and opens a fresh frame queue.
    pub fn add_member(&self, member: MemberId) {
        if usize::from(member) >= MAX_MEMBERS || member == self.local_id {
            return;
        }

        let mut ids = self.lock_ids();
        if ids.contains(&member) {
            return;
        }
        {
            let mut state = self.lock_member(member);
            *state = MemberState::admitted(&self.master_secret, self.local_id, member);
        }
        ids.push(member);
        ids.sort_unstable();
        info!(member, "cluster member added");
    }

    /// Removes a member from the cluster. Its slot becomes invisible and
    /// may be reused by a later [`add_member`](Self::add_member).
    pub fn remove_member(&self, member: MemberId) {
        let mut ids = self.lock_ids();
        if let Some(index) = ids.iter().position(|id| *id == member) {
            ids.remove(index);
            info!(member, "cluster member removed");
        }
    }

    // ------------------------------------------------------------------
    // Frame intake
    // ------------------------------------------------------------------

    /// Handles one sealed frame received from another member.
    ///
    /// Frames that fail authentication, address someone else, claim to be
    /// from us, or come from an id outside the live member set are
    /// dropped without signal. Malformed sub-messages are skipped
    /// individually.
    pub fn handle_incoming(&self, frame: &[u8]) {
        let body = match framer::unseal(frame, &self.inbound_key) {
            Ok(body) => body,
            Err(error) => {
                trace!(%error, len = frame.len(), "dropping cluster frame");
                return;
            }
        };
        if body.len() < 4 {
            return;
        }

        let from = u16::from_be_bytes([body[0], body[1]]);
        let to = u16::from_be_bytes([body[2], body[3]]);
        if from == self.local_id {
            trace!("dropping frame claiming to be from ourselves");
            return;
        }
        if to != self.local_id || usize::from(from) >= MAX_MEMBERS {
            trace!(from, to, "dropping misaddressed frame");
            return;
        }
        if !self.lock_ids().contains(&from) {
            debug!(from, "dropping frame from non-member");
            return;
        }

        let mut state = self.lock_member(from);
        let mut ptr = 4usize;
        while ptr + 2 <= body.len() {
            let len = usize::from(u16::from_be_bytes([body[ptr], body[ptr + 1]]));
            ptr += 2;
            let Some(next) = ptr.checked_add(len) else {
                break;
            };
            if next > body.len() {
                break;
            }
            if len > 0 {
                let kind_byte = body[ptr];
                let payload = &body[ptr + 1..next];
                match MessageKind::from_u8(kind_byte) {
                    None => trace!(kind = kind_byte, "ignoring unknown state message type"),
                    Some(kind) => match StateMessage::decode(kind, payload) {
                        Ok(message) => self.dispatch(from, &mut state, message),
                        Err(error) => {
                            debug!(from, ?kind, %error, "skipping malformed state message");
                        }
                    },
                }
            }
            ptr = next;
        }
    }

    fn dispatch(&self, from: MemberId, state: &mut MemberState, message: StateMessage) {
        match message {
            StateMessage::Alive(info) => {
                let now = self.host.now();
                if !state.is_alive(now, MEMBER_ALIVE_TIMEOUT) {
                    debug!(
                        member = from,
                        x = info.location.x,
                        y = info.location.y,
                        z = info.location.z,
                        endpoints = info.endpoints.len(),
                        "member is alive"
                    );
                }
                state.location = info.location;
                state.load = info.load;
                state.endpoints = info.endpoints;
                state.last_received_alive = now;
            }

            StateMessage::HavePeer { identity, address } => {
                let now = self.host.now();
                // Forget our own path to the peer at that address; the
                // announcing member owns it now, and competing for it
                // causes route flapping.
                if let Some(address) = address {
                    if let Some(peer) = self.host.topology().peer(identity.address, now) {
                        peer.remove_path_by_address(address);
                    }
                }
                self.host.topology().save_identity(&identity);
                self.affinity.record_remote(identity.address, from, now);
                trace!(member = from, peer = %identity.address, "peer affinity updated");
            }

            StateMessage::MulticastLike {
                network_id,
                peer,
                group,
            } => {
                self.host
                    .multicast()
                    .add(self.host.now(), network_id, group, peer);
            }

            StateMessage::Com(_) => {
                // Certificates of membership are replicated for future
                // use but not consumed yet.
                trace!(member = from, "ignoring certificate of membership");
            }

            StateMessage::ProxyUnite {
                local_peer,
                remote_peer,
                paths,
            } => self.handle_proxy_unite(from, state, local_peer, remote_peer, &paths),

            StateMessage::ProxySend {
                recipient,
                verb,
                payload,
            } => {
                trace!(member = from, peer = %recipient, verb, "proxy send");
                self.host.switch().send(
                    OverlayPacket {
                        dest: recipient,
                        source: self.identity_address,
                        verb,
                        payload,
                    },
                    true,
                    0,
                );
            }
        }
    }

    /// Runs our half of a rendezvous between `local_peer` (ours) and
    /// `remote_peer` (the requesting member's): tell our peer the remote
    /// peer's endpoint directly, and ship the mirror-image instruction
    /// back to the requesting member as a PROXY_SEND.
    fn handle_proxy_unite(
        &self,
        from: MemberId,
        state: &mut MemberState,
        local_peer: PeerAddress,
        remote_peer: PeerAddress,
        paths: &[SocketAddr],
    ) {
        let now = self.host.now();
        if paths.is_empty() {
            return;
        }
        let Some(peer) = self.host.topology().peer(local_peer, now) else {
            return;
        };

        let (local_v4, local_v6) = peer.best_active_addresses(now);
        let remote_v4 = paths.iter().find(|a| a.is_ipv4()).copied();
        let remote_v6 = paths.iter().find(|a| a.is_ipv6()).copied();

        // Prefer a matching IPv6 pair, then a matching IPv4 pair.
        let (local_endpoint, remote_endpoint) = if let (Some(l), Some(r)) = (local_v6, remote_v6) {
            (l, r)
        } else if let (Some(l), Some(r)) = (local_v4, remote_v4) {
            (l, r)
        } else {
            debug!(member = from, %local_peer, %remote_peer, "no address family match for rendezvous");
            return;
        };

        debug!(member = from, %local_peer, %remote_peer, "uniting peers across cluster members");

        let reply = StateMessage::ProxySend {
            recipient: remote_peer,
            verb: VERB_RENDEZVOUS,
            payload: rendezvous_payload(local_peer, local_endpoint),
        };
        self.enqueue(from, state, &reply);
        // Port-restricted NATs need both sides poked near-simultaneously,
        // so this frame cannot wait for the periodic flush.
        self.flush_member(from, state);

        self.host.switch().send(
            OverlayPacket {
                dest: local_peer,
                source: self.identity_address,
                verb: VERB_RENDEZVOUS,
                payload: rendezvous_payload(remote_peer, remote_endpoint),
            },
            true,
            0,
        );
    }

    // ------------------------------------------------------------------
    // Outbound queues
    // ------------------------------------------------------------------

    fn enqueue(&self, member: MemberId, state: &mut MemberState, message: &StateMessage) {
        let mut payload = Vec::new();
        message.encode_payload(&mut payload);
        if payload.len() + SUB_MESSAGE_OVERHEAD > MAX_MESSAGE_LEN - FRAME_HEADER_LEN {
            warn!(
                member,
                kind = ?message.kind(),
                len = payload.len(),
                "dropping oversized state message"
            );
            return;
        }
        if !state.queue.is_open() {
            return;
        }
        if !state.queue.fits(payload.len() + SUB_MESSAGE_OVERHEAD) {
            self.flush_member(member, state);
        }
        state.queue.append(message.kind() as u8, &payload);
    }

    fn flush_member(&self, member: MemberId, state: &mut MemberState) {
        let MemberState { key, queue, .. } = state;
        queue.flush(key, |frame| self.host.send_frame(member, frame));
    }

    fn broadcast(&self, message: &StateMessage) {
        let ids = self.lock_ids();
        for &id in ids.iter() {
            let mut state = self.lock_member(id);
            self.enqueue(id, &mut state, message);
        }
    }

    // ------------------------------------------------------------------
    // Replication and relay
    // ------------------------------------------------------------------

    /// Records that we own a direct path to `identity` at
    /// `physical_address` and announces it to the cluster.
    ///
    /// Announcements are debounced per peer: taking ownership away from
    /// another member broadcasts immediately, refreshing our own claim
    /// broadcasts at most once per [`HAVE_PEER_ANNOUNCE_INTERVAL`].
    pub fn replicate_have_peer(&self, identity: &PeerIdentity, physical_address: SocketAddr) {
        let now = self.host.now();
        if !self
            .affinity
            .claim_local(identity.address, self.local_id, now)
        {
            return;
        }
        trace!(peer = %identity.address, "announcing peer ownership");
        self.broadcast(&StateMessage::HavePeer {
            identity: identity.clone(),
            address: Some(physical_address),
        });
    }

    /// Replicates a peer's multicast subscription to every member.
    pub fn replicate_multicast_like(
        &self,
        network_id: u64,
        peer: PeerAddress,
        group: MulticastGroup,
    ) {
        self.broadcast(&StateMessage::MulticastLike {
            network_id,
            peer,
            group,
        });
    }

    /// Replicates an opaque certificate of network membership to every
    /// member.
    pub fn replicate_certificate_of_membership(&self, certificate: &[u8]) {
        self.broadcast(&StateMessage::Com(certificate.to_vec()));
    }

    /// Relays an overlay packet toward the member owning `to_peer`.
    ///
    /// Returns `false` when the affinity table has no fresh remote owner
    /// for the peer (or the payload is oversized), so the caller can try
    /// another delivery strategy. With `unite`, and when `from_peer` is
    /// known locally with at least one best endpoint, a PROXY_UNITE
    /// describing those endpoints is queued to the owner ahead of the
    /// relayed data; unite is best-effort and its absence never blocks
    /// the relay.
    pub fn send_via_cluster(
        &self,
        from_peer: Option<PeerAddress>,
        to_peer: PeerAddress,
        payload: &[u8],
        unite: bool,
    ) -> bool {
        if payload.len() > MAX_MESSAGE_LEN {
            return false;
        }

        let now = self.host.now();
        let Some(owner) = self.affinity.owner_for(to_peer, self.local_id, now) else {
            return false;
        };

        let mut unite_message = None;
        if unite {
            if let Some(from) = from_peer {
                if let Some(peer) = self.host.topology().peer(from, now) {
                    let (v4, v6) = peer.best_active_addresses(now);
                    let paths: Vec<SocketAddr> = [v4, v6].into_iter().flatten().collect();
                    if !paths.is_empty() {
                        unite_message = Some(StateMessage::ProxyUnite {
                            local_peer: to_peer,
                            remote_peer: from,
                            paths,
                        });
                    }
                }
            }
        }

        {
            let mut state = self.lock_member(owner);
            if let Some(message) = &unite_message {
                self.enqueue(owner, &mut state, message);
            }
            if let Some(endpoint) = state.endpoints.first() {
                self.host.put_packet(*endpoint, payload);
            }
        }

        debug!(
            from = ?from_peer.map(|p| p.to_string()),
            to = %to_peer,
            via = owner,
            len = payload.len(),
            "relayed peer packet through owning member"
        );
        true
    }

    // ------------------------------------------------------------------
    // Geo redirection
    // ------------------------------------------------------------------

    /// Picks a better member endpoint for a peer currently talking to us
    /// from `peer_physical_address`.
    ///
    /// Returns an endpoint of the live, located member strictly closest
    /// to the peer's geolocated point, in the same address family as the
    /// peer's current path. The member must beat our own distance, or
    /// beat any distance at all when `offload` forces the peer off this
    /// node. Returns `None` when no geolocation is deployed, the oracle
    /// has no data yet, or nobody qualifies.
    #[must_use]
    pub fn find_better_endpoint(
        &self,
        peer: PeerAddress,
        peer_physical_address: SocketAddr,
        offload: bool,
    ) -> Option<SocketAddr> {
        let local_location = self.location?;
        let Some(point) = self.host.geolocate(peer_physical_address) else {
            trace!(%peer, "no geolocation data yet for peer address");
            return None;
        };

        let now = self.host.now();
        let current_distance = local_location.distance_to(point);
        let mut best_distance = if offload {
            OFFLOAD_BASELINE
        } else {
            current_distance
        };
        let mut best_endpoints: Vec<SocketAddr> = Vec::new();

        {
            let ids = self.lock_ids();
            for &id in ids.iter() {
                let state = self.lock_member(id);
                if !state.is_alive(now, MEMBER_ALIVE_TIMEOUT)
                    || state.location.is_unknown()
                    || state.endpoints.is_empty()
                {
                    continue;
                }
                let distance = state.location.distance_to(point);
                if distance < best_distance {
                    best_distance = distance;
                    best_endpoints = state.endpoints.clone();
                }
            }
        }

        let redirect = best_endpoints
            .into_iter()
            .find(|endpoint| endpoint.is_ipv4() == peer_physical_address.is_ipv4());
        if let Some(endpoint) = redirect {
            debug!(%peer, %endpoint, current_distance, best_distance, "redirecting peer to closer member");
        }
        redirect
    }

    // ------------------------------------------------------------------
    // Periodic loop
    // ------------------------------------------------------------------

    /// Drives housekeeping; the host calls this at up to one-second
    /// cadence from any thread.
    ///
    /// Sweeps long-dead affinity entries, re-announces peers we hold
    /// current best paths to, and, every [`FLUSH_INTERVAL`], queues
    /// ALIVE heartbeats where due and seals/sends every member's pending
    /// frames.
    pub fn do_periodic_tasks(&self) {
        let now = self.host.now();

        if interval_elapsed(&self.last_affinity_sweep, AffinityMap::sweep_interval(), now) {
            self.affinity.sweep(now);
        }

        if interval_elapsed(
            &self.last_announce_check,
            HAVE_PEER_ANNOUNCE_INTERVAL / 4,
            now,
        ) {
            self.host.topology().for_each_peer(&mut |peer| {
                if let Some(path) = peer.best_path_address(now) {
                    self.replicate_have_peer(&peer.identity(), path);
                }
            });
        }

        if interval_elapsed(&self.last_flush, FLUSH_INTERVAL, now) {
            let ids = self.lock_ids();
            for &id in ids.iter() {
                let mut state = self.lock_member(id);
                if now.saturating_sub(state.last_announced_alive_to) >= ALIVE_ANNOUNCE_INTERVAL {
                    let alive = StateMessage::Alive(AliveInfo {
                        version: (VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION),
                        protocol_version: PROTOCOL_VERSION,
                        location: self.location.unwrap_or(GeoPoint::UNKNOWN),
                        local_clock: now,
                        load: 0,
                        flags: 0,
                        endpoints: self.endpoints.clone(),
                    });
                    self.enqueue(id, &mut state, &alive);
                    state.last_announced_alive_to = now;
                }
                self.flush_member(id, &mut state);
            }
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Takes a read-only snapshot of the cluster: the local member
    /// first, then every live member with its advertised state and the
    /// number of fresh affinity entries it owns.
    #[must_use]
    pub fn status(&self) -> ClusterStatus {
        let now = self.host.now();
        let local_location = self.location.unwrap_or(GeoPoint::UNKNOWN);

        let mut members = vec![MemberStatus {
            id: self.local_id,
            alive: true,
            ms_since_heartbeat: 0,
            x: local_location.x,
            y: local_location.y,
            z: local_location.z,
            load: 0,
            endpoints: self.endpoints.clone(),
            peer_count: self.host.topology().active_peer_count(now),
        }];

        let counts = self.affinity.fresh_owner_counts(self.local_id, now);
        {
            let ids = self.lock_ids();
            for &id in ids.iter() {
                let state = self.lock_member(id);
                members.push(MemberStatus {
                    id,
                    alive: state.is_alive(now, MEMBER_ALIVE_TIMEOUT),
                    ms_since_heartbeat: now.saturating_sub(state.last_received_alive),
                    x: state.location.x,
                    y: state.location.y,
                    z: state.location.z,
                    load: state.load,
                    endpoints: state.endpoints.clone(),
                    peer_count: counts.get(&id).copied().unwrap_or(0),
                });
            }
        }

        ClusterStatus {
            my_id: self.local_id,
            cluster_size: members.len(),
            members,
        }
    }
}

/// Rendezvous instruction payload: flags, the other peer's address, and
/// the endpoint to punch toward.
fn rendezvous_payload(other_peer: PeerAddress, endpoint: SocketAddr) -> Vec<u8> {
    let mut buf = vec![0u8];
    buf.extend_from_slice(other_peer.as_bytes());
    buf.extend_from_slice(&endpoint.port().to_be_bytes());
    match endpoint {
        SocketAddr::V4(v4) => {
            buf.push(4);
            buf.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            buf.push(16);
            buf.extend_from_slice(&v6.ip().octets());
        }
    }
    buf
}

/// Claims an interval tick: true at most once per `interval`, racing
/// callers resolved by the compare-exchange.
fn interval_elapsed(stamp: &AtomicU64, interval: u64, now: u64) -> bool {
    let last = stamp.load(Ordering::Relaxed);
    now.saturating_sub(last) >= interval
        && stamp
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
}
