//! Overlay identities.
//!
//! [`PeerIdentity`] is the public identity of a remote overlay peer as
//! replicated in HAVE_PEER announcements. [`NodeIdentity`] is the local
//! node's identity; its private key material seeds the cluster-wide master
//! secret and is never exposed beyond that derivation.

use std::fmt;

use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::wire::{Cursor, PeerAddress, WireError};

/// Number of bytes in the cluster master secret.
pub const MASTER_SECRET_LEN: usize = 64;

/// The public identity of an overlay peer: its 40-bit address plus public
/// key material, treated as opaque bytes by the cluster core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// The peer's overlay address.
    pub address: PeerAddress,
    /// The peer's public key material.
    pub public_key: Vec<u8>,
}

impl PeerIdentity {
    /// Builds an identity from its parts.
    #[must_use]
    pub fn new(address: PeerAddress, public_key: Vec<u8>) -> Self {
        Self {
            address,
            public_key,
        }
    }

    /// Appends the wire form: 5-byte address, `u16` key length, key bytes.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.address.as_bytes());
        let len = u16::try_from(self.public_key.len()).unwrap_or(u16::MAX);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.public_key[..usize::from(len)]);
    }

    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let address = cur.read_peer_address()?;
        let len = cur.read_u16()?;
        let public_key = cur.read_bytes(usize::from(len))?.to_vec();
        Ok(Self {
            address,
            public_key,
        })
    }
}

/// The local node's overlay identity.
///
/// All members of a cluster share one overlay identity; the 16-bit member
/// id is the only thing distinguishing them on the cluster wire. The
/// private key is held in zeroizing storage and is only ever read to
/// derive the master secret.
pub struct NodeIdentity {
    address: PeerAddress,
    secret_key: Zeroizing<Vec<u8>>,
}

impl NodeIdentity {
    /// Builds an identity from the overlay address and private key bytes.
    #[must_use]
    pub fn new(address: PeerAddress, secret_key: Vec<u8>) -> Self {
        Self {
            address,
            secret_key: Zeroizing::new(secret_key),
        }
    }

    /// The node's overlay address.
    #[must_use]
    pub const fn address(&self) -> PeerAddress {
        self.address
    }

    /// Derives the 64-byte cluster master secret by hashing the private
    /// key material with SHA-512.
    #[must_use]
    pub fn master_secret(&self) -> Zeroizing<[u8; MASTER_SECRET_LEN]> {
        let mut secret = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
        secret.copy_from_slice(Sha512::digest(self.secret_key.as_slice()).as_slice());
        secret
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("address", &self.address)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}
