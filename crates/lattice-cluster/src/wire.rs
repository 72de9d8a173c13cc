//! Wire-level primitives shared by the framer and the state-message codec.
//!
//! Everything on the cluster wire is big-endian. Parsing is done through a
//! bounds-checked [`Cursor`] that returns a typed [`WireError`] instead of
//! panicking; a malformed sub-message is skipped by the caller, never
//! propagated to the host.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// A cluster member id. Valid ids are below
/// [`crate::cluster::MAX_MEMBERS`]; assignment is administrative and
/// external to this crate.
pub type MemberId = u16;

/// Length of an overlay peer address in bytes (40 bits).
pub const PEER_ADDRESS_LEN: usize = 5;

/// Length of an Ethernet MAC address in bytes.
pub const MAC_LEN: usize = 6;

/// Errors produced while decoding wire data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// The input ended before the field being read.
    #[error("unexpected end of input at offset {offset}")]
    Truncated {
        /// Offset at which more bytes were required.
        offset: usize,
    },

    /// A serialized socket address carried an unrecognized family tag.
    #[error("unrecognized address family tag {tag}")]
    BadAddressTag {
        /// The offending tag byte.
        tag: u8,
    },
}

/// A 40-bit overlay peer address.
///
/// Peers are participants of the overlay outside the cluster; the address
/// is how the affinity table, relay, and rendezvous logic refer to them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress([u8; PEER_ADDRESS_LEN]);

impl PeerAddress {
    /// Builds an address from its raw big-endian bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PEER_ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds an address from the low 40 bits of an integer.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        let v = value & 0xff_ffff_ffff;
        Self([
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ])
    }

    /// Returns the raw big-endian bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PEER_ADDRESS_LEN] {
        &self.0
    }

    /// Returns the address as the low 40 bits of a `u64`.
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        ((self.0[0] as u64) << 32)
            | ((self.0[1] as u64) << 24)
            | ((self.0[2] as u64) << 16)
            | ((self.0[3] as u64) << 8)
            | (self.0[4] as u64)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.to_u64())
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({self})")
    }
}

/// A 48-bit Ethernet MAC address, as carried by multicast subscriptions.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mac([u8; MAC_LEN]);

impl Mac {
    /// Builds a MAC from its raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; MAC_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({self})")
    }
}

/// Socket-address family tags on the wire.
const ADDR_TAG_NONE: u8 = 0;
const ADDR_TAG_V4: u8 = 4;
const ADDR_TAG_V6: u8 = 6;

/// Appends a socket address to `buf` in the overlay's tagged format.
///
/// `None` encodes as a single zero tag byte; concrete addresses carry the
/// family tag, the raw ip bytes, and a big-endian port.
pub(crate) fn write_socket_addr(buf: &mut Vec<u8>, addr: Option<&SocketAddr>) {
    match addr {
        None => buf.push(ADDR_TAG_NONE),
        Some(SocketAddr::V4(v4)) => {
            buf.push(ADDR_TAG_V4);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            buf.push(ADDR_TAG_V6);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

/// A bounds-checked big-endian reader over a byte slice.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated { offset: self.pos });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_peer_address(&mut self) -> Result<PeerAddress, WireError> {
        let b = self.read_bytes(PEER_ADDRESS_LEN)?;
        let mut raw = [0u8; PEER_ADDRESS_LEN];
        raw.copy_from_slice(b);
        Ok(PeerAddress::from_bytes(raw))
    }

    pub fn read_mac(&mut self) -> Result<Mac, WireError> {
        let b = self.read_bytes(MAC_LEN)?;
        let mut raw = [0u8; MAC_LEN];
        raw.copy_from_slice(b);
        Ok(Mac::from_bytes(raw))
    }

    /// Reads one tagged socket address. A zero tag yields `None`.
    pub fn read_socket_addr(&mut self) -> Result<Option<SocketAddr>, WireError> {
        let tag = self.read_u8()?;
        match tag {
            ADDR_TAG_NONE => Ok(None),
            ADDR_TAG_V4 => {
                let b = self.read_bytes(4)?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = self.read_u16()?;
                Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            ADDR_TAG_V6 => {
                let b = self.read_bytes(16)?;
                let mut raw = [0u8; 16];
                raw.copy_from_slice(b);
                let port = self.read_u16()?;
                Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(raw)), port)))
            }
            tag => Err(WireError::BadAddressTag { tag }),
        }
    }
}
