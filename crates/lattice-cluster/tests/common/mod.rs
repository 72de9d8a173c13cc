//! Recording mock host shared by the end-to-end scenario tests.
//!
//! `TestHost` implements every collaborator trait the cluster core
//! consumes and records everything the core hands back out: sealed
//! frames, raw relayed packets, overlay packets given to the switch, and
//! multicast subscriptions. Tests wire two or more real `Cluster`
//! instances together by draining one host's frames into another
//! cluster's `handle_incoming`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;
use sha2::{Digest, Sha512};

use lattice_cluster::{
    ClusterHost, GeoPoint, MemberId, MulticastDirectory, MulticastGroup, NodeIdentity,
    OverlayPacket, Peer, PeerAddress, PeerIdentity, Switch, Topology,
};

/// Private key material of the overlay identity every test cluster
/// shares; the master secret is its SHA-512 digest.
pub const SHARED_SECRET_KEY: [u8; 64] = [0u8; 64];

/// Overlay address of the shared cluster identity.
pub const CLUSTER_ADDRESS: u64 = 0xcc_0000_0001;

pub fn shared_identity() -> NodeIdentity {
    NodeIdentity::new(
        PeerAddress::from_u64(CLUSTER_ADDRESS),
        SHARED_SECRET_KEY.to_vec(),
    )
}

pub fn peer_identity(address: u64) -> PeerIdentity {
    PeerIdentity::new(PeerAddress::from_u64(address), vec![0x42; 32])
}

// ----------------------------------------------------------------------
// Topology mocks
// ----------------------------------------------------------------------

#[derive(Default)]
struct TestPeerState {
    best_v4: Option<SocketAddr>,
    best_v6: Option<SocketAddr>,
    removed_paths: Vec<SocketAddr>,
}

pub struct TestPeer {
    identity: PeerIdentity,
    state: Mutex<TestPeerState>,
}

impl TestPeer {
    pub fn new(identity: PeerIdentity) -> Arc<Self> {
        Arc::new(Self {
            identity,
            state: Mutex::new(TestPeerState::default()),
        })
    }

    pub fn set_best_addresses(&self, v4: Option<SocketAddr>, v6: Option<SocketAddr>) {
        let mut state = self.state.lock().unwrap();
        state.best_v4 = v4;
        state.best_v6 = v6;
    }

    pub fn removed_paths(&self) -> Vec<SocketAddr> {
        self.state.lock().unwrap().removed_paths.clone()
    }
}

impl Peer for TestPeer {
    fn identity(&self) -> PeerIdentity {
        self.identity.clone()
    }

    fn best_path_address(&self, _now: u64) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap();
        state.best_v4.or(state.best_v6)
    }

    fn best_active_addresses(&self, _now: u64) -> (Option<SocketAddr>, Option<SocketAddr>) {
        let state = self.state.lock().unwrap();
        (state.best_v4, state.best_v6)
    }

    fn remove_path_by_address(&self, address: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        state.removed_paths.push(address);
        if state.best_v4 == Some(address) {
            state.best_v4 = None;
        }
        if state.best_v6 == Some(address) {
            state.best_v6 = None;
        }
    }
}

#[derive(Default)]
pub struct TestTopology {
    peers: Mutex<HashMap<PeerAddress, Arc<TestPeer>>>,
    saved: Mutex<Vec<PeerIdentity>>,
    active_count: AtomicUsize,
}

impl TestTopology {
    pub fn insert_peer(&self, peer: Arc<TestPeer>) {
        self.peers
            .lock()
            .unwrap()
            .insert(peer.identity.address, peer);
    }

    pub fn saved_identities(&self) -> Vec<PeerIdentity> {
        self.saved.lock().unwrap().clone()
    }

    pub fn set_active_count(&self, count: usize) {
        self.active_count.store(count, Ordering::Relaxed);
    }
}

impl Topology for TestTopology {
    fn peer(&self, address: PeerAddress, _now: u64) -> Option<Arc<dyn Peer>> {
        self.peers
            .lock()
            .unwrap()
            .get(&address)
            .map(|peer| Arc::clone(peer) as Arc<dyn Peer>)
    }

    fn save_identity(&self, identity: &PeerIdentity) {
        self.saved.lock().unwrap().push(identity.clone());
    }

    fn for_each_peer(&self, visit: &mut dyn FnMut(&dyn Peer)) {
        for peer in self.peers.lock().unwrap().values() {
            visit(peer.as_ref());
        }
    }

    fn active_peer_count(&self, _now: u64) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

// ----------------------------------------------------------------------
// Recording host
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct TestHost {
    clock: AtomicU64,
    pub topology: TestTopology,
    frames: Mutex<Vec<(MemberId, Vec<u8>)>>,
    packets: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    overlay: Mutex<Vec<(OverlayPacket, bool, u64)>>,
    likes: Mutex<Vec<(u64, u64, MulticastGroup, PeerAddress)>>,
    geo: Mutex<HashMap<SocketAddr, GeoPoint>>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_clock(&self, now: u64) {
        self.clock.store(now, Ordering::Relaxed);
    }

    pub fn add_geo(&self, address: SocketAddr, point: GeoPoint) {
        self.geo.lock().unwrap().insert(address, point);
    }

    /// Drains every recorded outbound frame.
    pub fn take_frames(&self) -> Vec<(MemberId, Vec<u8>)> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn packets(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.packets.lock().unwrap().clone()
    }

    pub fn overlay_packets(&self) -> Vec<(OverlayPacket, bool, u64)> {
        self.overlay.lock().unwrap().clone()
    }

    pub fn likes(&self) -> Vec<(u64, u64, MulticastGroup, PeerAddress)> {
        self.likes.lock().unwrap().clone()
    }
}

impl ClusterHost for TestHost {
    fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn send_frame(&self, member: MemberId, frame: &[u8]) {
        self.frames.lock().unwrap().push((member, frame.to_vec()));
    }

    fn put_packet(&self, dest: SocketAddr, payload: &[u8]) {
        self.packets.lock().unwrap().push((dest, payload.to_vec()));
    }

    fn geolocate(&self, address: SocketAddr) -> Option<GeoPoint> {
        self.geo.lock().unwrap().get(&address).copied()
    }

    fn topology(&self) -> &dyn Topology {
        &self.topology
    }

    fn switch(&self) -> &dyn Switch {
        self
    }

    fn multicast(&self) -> &dyn MulticastDirectory {
        self
    }
}

impl Switch for TestHost {
    fn send(&self, packet: OverlayPacket, encrypt: bool, network_id: u64) {
        self.overlay
            .lock()
            .unwrap()
            .push((packet, encrypt, network_id));
    }
}

impl MulticastDirectory for TestHost {
    fn add(&self, now: u64, network_id: u64, group: MulticastGroup, member: PeerAddress) {
        self.likes
            .lock()
            .unwrap()
            .push((now, network_id, group, member));
    }
}

/// Drains `src`'s recorded frames and feeds those addressed to
/// `to_member` into `dst`. Frames for other members are discarded.
pub fn deliver<H: ClusterHost>(
    src: &TestHost,
    dst: &lattice_cluster::Cluster<H>,
    to_member: MemberId,
) -> usize {
    let mut delivered = 0;
    for (member, frame) in src.take_frames() {
        if member == to_member {
            dst.handle_incoming(&frame);
            delivered += 1;
        }
    }
    delivered
}

// ----------------------------------------------------------------------
// Independent frame sealing
// ----------------------------------------------------------------------
//
// Reimplemented from the wire definition rather than calling into the
// crate, so the receive path is probed with frames the crate's own
// framer could never be coaxed into producing (self-loops, non-member
// senders, arbitrary headers).

/// Derives the link key for `member`: `H(H(master ⊕ id))` truncated to
/// 32 bytes.
pub fn link_key(member: MemberId) -> [u8; 32] {
    let mut seed = [0u8; 64];
    seed.copy_from_slice(Sha512::digest(SHARED_SECRET_KEY).as_slice());
    seed[0] ^= (member >> 8) as u8;
    seed[1] ^= (member & 0xff) as u8;
    let first = Sha512::digest(seed);
    let second = Sha512::digest(first.as_slice());
    let mut key = [0u8; 32];
    key.copy_from_slice(&second.as_slice()[..32]);
    key
}

/// Seals one frame with `key` exactly as the cluster framer does:
/// IV, truncated Poly1305 tag over the ciphertext, encrypted sender and
/// recipient ids, then length-prefixed sub-messages.
pub fn seal_frame(
    key: &[u8; 32],
    from: MemberId,
    to: MemberId,
    sub_messages: &[(u8, &[u8])],
) -> Vec<u8> {
    let iv: [u8; 16] = [
        0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67,
        0x68,
    ];
    let mut frame = Vec::new();
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&[0u8; 8]);
    frame.extend_from_slice(&from.to_be_bytes());
    frame.extend_from_slice(&to.to_be_bytes());
    for (kind, payload) in sub_messages {
        frame.extend_from_slice(&u16::try_from(payload.len() + 1).unwrap().to_be_bytes());
        frame.push(*kind);
        frame.extend_from_slice(payload);
    }

    let mut one_shot = *key;
    for i in 0..8 {
        one_shot[i] ^= iv[i];
    }
    let mut cipher = Salsa12::new(
        salsa20::Key::from_slice(&one_shot),
        salsa20::Nonce::from_slice(&iv[8..16]),
    );
    let mut mac_key = [0u8; 32];
    cipher.apply_keystream(&mut mac_key);
    cipher.apply_keystream(&mut frame[24..]);
    let tag = Poly1305::new(poly1305::Key::from_slice(&mac_key)).compute_unpadded(&frame[24..]);
    frame[16..24].copy_from_slice(&tag.as_slice()[..8]);
    frame
}

/// Encodes a MULTICAST_LIKE payload for use with [`seal_frame`].
pub fn multicast_like_payload(network_id: u64, peer: u64, mac: [u8; 6], adi: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&network_id.to_be_bytes());
    buf.extend_from_slice(PeerAddress::from_u64(peer).as_bytes());
    buf.extend_from_slice(&mac);
    buf.extend_from_slice(&adi.to_be_bytes());
    buf
}

/// Encodes a socket address in the overlay's tagged wire form.
pub fn encode_socket_addr(buf: &mut Vec<u8>, address: Option<SocketAddr>) {
    match address {
        None => buf.push(0),
        Some(SocketAddr::V4(v4)) => {
            buf.push(4);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            buf.push(6);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

/// Encodes a HAVE_PEER payload for use with [`seal_frame`].
pub fn have_peer_payload(identity: &PeerIdentity, address: Option<SocketAddr>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(identity.address.as_bytes());
    buf.extend_from_slice(&u16::try_from(identity.public_key.len()).unwrap().to_be_bytes());
    buf.extend_from_slice(&identity.public_key);
    encode_socket_addr(&mut buf, address);
    buf
}
