//! Typed state messages carried inside sealed frames.
//!
//! Every sub-message is `u16` length, one type byte, then a type-specific
//! big-endian payload. Decoding returns a [`WireError`] for anything
//! malformed; the dispatch loop skips the offending sub-message and
//! resumes at its declared end, so a bad element never poisons the rest
//! of a frame.

use std::net::SocketAddr;

use crate::geo::GeoPoint;
use crate::identity::PeerIdentity;
use crate::wire::{write_socket_addr, Cursor, Mac, PeerAddress, WireError};

/// Major component of the software version advertised in ALIVE.
pub const VERSION_MAJOR: u16 = 0;
/// Minor component of the software version advertised in ALIVE.
pub const VERSION_MINOR: u16 = 1;
/// Revision component of the software version advertised in ALIVE.
pub const VERSION_REVISION: u16 = 0;
/// Cluster protocol revision; reserved, ignored on receipt.
pub const PROTOCOL_VERSION: u8 = 1;

/// State message type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Periodic member heartbeat with location and endpoints.
    Alive = 1,
    /// Peer ownership announcement.
    HavePeer = 2,
    /// Replicated multicast subscription.
    MulticastLike = 3,
    /// Replicated certificate of network membership (opaque).
    Com = 4,
    /// Request to run a rendezvous for a peer the recipient owns.
    ProxyUnite = 5,
    /// Request to originate an overlay packet on the sender's behalf.
    ProxySend = 6,
}

impl MessageKind {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Alive),
            2 => Some(Self::HavePeer),
            3 => Some(Self::MulticastLike),
            4 => Some(Self::Com),
            5 => Some(Self::ProxyUnite),
            6 => Some(Self::ProxySend),
            _ => None,
        }
    }
}

/// A multicast group: MAC address plus additional distinguishing
/// information (for ADI-scoped groups such as broadcast).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulticastGroup {
    /// The group MAC address.
    pub mac: Mac,
    /// Additional distinguishing information.
    pub adi: u32,
}

/// The body of an ALIVE heartbeat.
///
/// Version, local-clock, and flag fields are carried for forward
/// compatibility and ignored on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveInfo {
    /// Software version triple (major, minor, revision).
    pub version: (u16, u16, u16),
    /// Cluster protocol revision.
    pub protocol_version: u8,
    /// Advertised location; all-zero when unknown.
    pub location: GeoPoint,
    /// Sender's clock at send time, milliseconds.
    pub local_clock: u64,
    /// Advertised load; transmitted but unused by placement decisions.
    pub load: u64,
    /// Reserved flag bits.
    pub flags: u64,
    /// Physical endpoints remote peers can be steered to.
    pub endpoints: Vec<SocketAddr>,
}

/// One decoded state message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateMessage {
    /// Member heartbeat.
    Alive(AliveInfo),

    /// The sending member owns a direct path to this peer.
    HavePeer {
        /// The peer's replicated identity.
        identity: PeerIdentity,
        /// The physical address the sender reaches the peer at, when
        /// known.
        address: Option<SocketAddr>,
    },

    /// A peer subscribed to a multicast group.
    MulticastLike {
        /// The overlay network the subscription belongs to.
        network_id: u64,
        /// The subscribing peer.
        peer: PeerAddress,
        /// The subscribed group.
        group: MulticastGroup,
    },

    /// An opaque certificate of network membership. Broadcast for future
    /// use; dropped silently on receipt.
    Com(Vec<u8>),

    /// Unite the recipient-owned `local_peer` with the sender-owned
    /// `remote_peer`, whose candidate paths are attached.
    ProxyUnite {
        /// Peer owned by the recipient of this message.
        local_peer: PeerAddress,
        /// Peer owned by the sender of this message.
        remote_peer: PeerAddress,
        /// The remote peer's candidate physical paths.
        paths: Vec<SocketAddr>,
    },

    /// Originate an overlay packet to `recipient` from the cluster's
    /// shared identity.
    ProxySend {
        /// Overlay destination.
        recipient: PeerAddress,
        /// Overlay packet verb.
        verb: u8,
        /// Overlay packet payload.
        payload: Vec<u8>,
    },
}

impl StateMessage {
    /// The wire type byte for this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Alive(_) => MessageKind::Alive,
            Self::HavePeer { .. } => MessageKind::HavePeer,
            Self::MulticastLike { .. } => MessageKind::MulticastLike,
            Self::Com(_) => MessageKind::Com,
            Self::ProxyUnite { .. } => MessageKind::ProxyUnite,
            Self::ProxySend { .. } => MessageKind::ProxySend,
        }
    }

    /// Appends the type-specific payload (everything after the type
    /// byte) to `buf`.
    pub(crate) fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Alive(info) => {
                buf.extend_from_slice(&info.version.0.to_be_bytes());
                buf.extend_from_slice(&info.version.1.to_be_bytes());
                buf.extend_from_slice(&info.version.2.to_be_bytes());
                buf.push(info.protocol_version);
                buf.extend_from_slice(&info.location.x.to_be_bytes());
                buf.extend_from_slice(&info.location.y.to_be_bytes());
                buf.extend_from_slice(&info.location.z.to_be_bytes());
                buf.extend_from_slice(&info.local_clock.to_be_bytes());
                buf.extend_from_slice(&info.load.to_be_bytes());
                buf.extend_from_slice(&info.flags.to_be_bytes());
                let count = info.endpoints.len().min(usize::from(u8::MAX));
                buf.push(count as u8);
                for endpoint in &info.endpoints[..count] {
                    write_socket_addr(buf, Some(endpoint));
                }
            }
            Self::HavePeer { identity, address } => {
                identity.encode(buf);
                write_socket_addr(buf, address.as_ref());
            }
            Self::MulticastLike {
                network_id,
                peer,
                group,
            } => {
                buf.extend_from_slice(&network_id.to_be_bytes());
                buf.extend_from_slice(peer.as_bytes());
                buf.extend_from_slice(group.mac.as_bytes());
                buf.extend_from_slice(&group.adi.to_be_bytes());
            }
            Self::Com(blob) => buf.extend_from_slice(blob),
            Self::ProxyUnite {
                local_peer,
                remote_peer,
                paths,
            } => {
                buf.extend_from_slice(local_peer.as_bytes());
                buf.extend_from_slice(remote_peer.as_bytes());
                let count = paths.len().min(usize::from(u8::MAX));
                buf.push(count as u8);
                for path in &paths[..count] {
                    write_socket_addr(buf, Some(path));
                }
            }
            Self::ProxySend {
                recipient,
                verb,
                payload,
            } => {
                buf.extend_from_slice(recipient.as_bytes());
                buf.push(*verb);
                let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(&payload[..usize::from(len)]);
            }
        }
    }

    /// Decodes the payload of a sub-message of the given kind.
    ///
    /// Nil socket addresses inside endpoint/path lists are dropped here so
    /// downstream logic only ever sees concrete addresses.
    pub(crate) fn decode(kind: MessageKind, payload: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(payload);
        match kind {
            MessageKind::Alive => {
                let version = (cur.read_u16()?, cur.read_u16()?, cur.read_u16()?);
                let protocol_version = cur.read_u8()?;
                let location = GeoPoint::new(cur.read_i32()?, cur.read_i32()?, cur.read_i32()?);
                let local_clock = cur.read_u64()?;
                let load = cur.read_u64()?;
                let flags = cur.read_u64()?;
                let count = cur.read_u8()?;
                let mut endpoints = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    if let Some(endpoint) = cur.read_socket_addr()? {
                        endpoints.push(endpoint);
                    }
                }
                Ok(Self::Alive(AliveInfo {
                    version,
                    protocol_version,
                    location,
                    local_clock,
                    load,
                    flags,
                    endpoints,
                }))
            }
            MessageKind::HavePeer => {
                let identity = PeerIdentity::decode(&mut cur)?;
                let address = cur.read_socket_addr()?;
                Ok(Self::HavePeer { identity, address })
            }
            MessageKind::MulticastLike => {
                let network_id = cur.read_u64()?;
                let peer = cur.read_peer_address()?;
                let mac = cur.read_mac()?;
                let adi = cur.read_u32()?;
                Ok(Self::MulticastLike {
                    network_id,
                    peer,
                    group: MulticastGroup { mac, adi },
                })
            }
            MessageKind::Com => Ok(Self::Com(payload.to_vec())),
            MessageKind::ProxyUnite => {
                let local_peer = cur.read_peer_address()?;
                let remote_peer = cur.read_peer_address()?;
                let count = cur.read_u8()?;
                let mut paths = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    if let Some(path) = cur.read_socket_addr()? {
                        paths.push(path);
                    }
                }
                Ok(Self::ProxyUnite {
                    local_peer,
                    remote_peer,
                    paths,
                })
            }
            MessageKind::ProxySend => {
                let recipient = cur.read_peer_address()?;
                let verb = cur.read_u8()?;
                let len = cur.read_u16()?;
                let payload = cur.read_bytes(usize::from(len))?.to_vec();
                Ok(Self::ProxySend {
                    recipient,
                    verb,
                    payload,
                })
            }
        }
    }
}
