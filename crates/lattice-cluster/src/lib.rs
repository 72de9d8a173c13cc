//! # lattice-cluster
//!
//! Cluster coordination core for the Lattice virtual-networking overlay.
//!
//! A Lattice cluster presents a small set of physical nodes (**members**,
//! at most 128, each with a stable 16-bit id) to the rest of the overlay
//! as a single logical endpoint. Any member can accept traffic from any
//! remote peer; this crate provides the member-to-member control plane
//! that makes that work:
//!
//! - an authenticated, confidential, batched frame channel between every
//!   pair of members, keyed per link from a shared master secret
//! - a replicated peer-affinity table mapping overlay peers to the member
//!   that currently owns a direct path to them
//! - packet relay toward the owning member, plus a proxied rendezvous
//!   handshake that unites peers owned by different members through NAT
//! - a geography-aware redirector that steers remote peers toward the
//!   closest member
//!
//! The core is fully thread-safe and owns no I/O: the embedding node
//! supplies a [`ClusterHost`] with the clock, frame/packet senders, the
//! geolocation oracle, and the topology/switch/multicast collaborators.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lattice_cluster::{Cluster, ClusterConfig, GeoPoint, NodeIdentity, PeerAddress};
//! # fn demo(host: impl lattice_cluster::ClusterHost) -> Result<(), Box<dyn std::error::Error>> {
//! let identity = NodeIdentity::new(PeerAddress::from_bytes([0x9a, 0x01, 0x02, 0x03, 0x04]),
//!     vec![0x5c; 64]);
//! let cluster = Cluster::new(host, &identity, ClusterConfig {
//!     local_id: 1,
//!     location: Some(GeoPoint::new(100, -30, 0)),
//!     endpoints: vec!["198.51.100.10:9993".parse()?],
//! })?;
//! cluster.add_member(2);
//! // feed inbound frames: cluster.handle_incoming(&frame);
//! // and call cluster.do_periodic_tasks() at ~1s cadence.
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cluster;
pub mod framer;
pub mod geo;
pub mod host;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use cluster::{
    Cluster, ClusterConfig, ClusterConfigError, ClusterStatus, MemberStatus, MAX_MEMBERS,
};
pub use framer::MAX_MESSAGE_LEN;
pub use geo::GeoPoint;
pub use host::{
    ClusterHost, MulticastDirectory, OverlayPacket, Peer, Switch, Topology, VERB_RENDEZVOUS,
};
pub use identity::{NodeIdentity, PeerIdentity};
pub use protocol::{MulticastGroup, StateMessage};
pub use wire::{Mac, MemberId, PeerAddress};
