//! Sealed frame channel between cluster members.
//!
//! Each ordered pair of members shares a batched outbound queue. Sub-
//! messages accumulate behind a 28-byte header (16-byte IV, 8 bytes
//! reserved for a truncated MAC, sender id, recipient id) and are sealed
//! on flush: a one-shot key is folded out of the link key and the IV, the
//! first 32 bytes of keystream become a one-time Poly1305 key, the body is
//! encrypted in place, and the MAC is computed over the ciphertext
//! (encrypt-then-MAC).
//!
//! Link keys are deterministic: `H(H(master_secret ⊕ id))` truncated to 32
//! bytes, where the 16-bit member id is XORed into the first two bytes of
//! the master secret and `H` is SHA-512. Because every member derives the
//! same schedule from the shared master secret, a member's own link key
//! doubles as its inbound key: whoever writes to member `m` seals with
//! `m`'s key.
//!
//! Authenticated-decryption failure is the trust boundary here; a bad MAC
//! is indistinguishable from any other drop.

use std::fmt;

use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::identity::MASTER_SECRET_LEN;
use crate::wire::MemberId;

/// Hard ceiling on a sealed frame, enforced on both sides of the link.
/// Enqueueing past it flushes; receiving past it drops.
pub const MAX_MESSAGE_LEN: usize = 16384;

/// Bytes of IV at the head of every frame.
pub(crate) const IV_LEN: usize = 16;

/// Bytes of truncated Poly1305 tag following the IV.
pub(crate) const MAC_LEN: usize = 8;

/// IV plus truncated MAC; everything after this offset is ciphertext.
pub(crate) const SEAL_OVERHEAD: usize = IV_LEN + MAC_LEN;

/// Sealing overhead plus the encrypted sender/recipient ids.
pub(crate) const FRAME_HEADER_LEN: usize = SEAL_OVERHEAD + 4;

/// Per-sub-message framing cost: `u16` length prefix plus the type byte.
pub(crate) const SUB_MESSAGE_OVERHEAD: usize = 3;

/// Bytes in a per-link key.
pub(crate) const LINK_KEY_LEN: usize = 32;

/// Reasons an inbound frame fails to unseal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame is shorter than the IV plus MAC.
    #[error("frame of {len} bytes is shorter than the sealing overhead")]
    TooShort {
        /// Observed frame length.
        len: usize,
    },

    /// The frame exceeds [`MAX_MESSAGE_LEN`].
    #[error("frame of {len} bytes exceeds the maximum frame length")]
    TooLong {
        /// Observed frame length.
        len: usize,
    },

    /// The truncated MAC did not verify.
    #[error("frame authentication failed")]
    Mac,
}

/// A 32-byte per-link key, zeroized on drop.
#[derive(Clone)]
pub(crate) struct LinkKey(Zeroizing<[u8; LINK_KEY_LEN]>);

impl LinkKey {
    /// An all-zero placeholder for member slots outside the live set.
    pub fn vacant() -> Self {
        Self(Zeroizing::new([0u8; LINK_KEY_LEN]))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LinkKey(REDACTED)")
    }
}

/// Derives the link key for `member` from the cluster master secret.
pub(crate) fn derive_link_key(
    master_secret: &[u8; MASTER_SECRET_LEN],
    member: MemberId,
) -> LinkKey {
    let mut seed = Zeroizing::new(*master_secret);
    seed[0] ^= (member >> 8) as u8;
    seed[1] ^= (member & 0x00ff) as u8;

    let mut first = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
    first.copy_from_slice(Sha512::digest(seed.as_slice()).as_slice());
    let mut second = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
    second.copy_from_slice(Sha512::digest(first.as_slice()).as_slice());

    let mut key = Zeroizing::new([0u8; LINK_KEY_LEN]);
    key.copy_from_slice(&second[..LINK_KEY_LEN]);
    LinkKey(key)
}

/// Builds the one-shot stream cipher for a frame and peels off the
/// one-time MAC key from the head of its keystream.
///
/// The one-shot key is the link key with its first 8 bytes XORed with the
/// first half of the IV; the second half of the IV is the cipher nonce.
fn one_time_cipher(key: &LinkKey, iv: &[u8; IV_LEN]) -> (Salsa12, Zeroizing<[u8; 32]>) {
    let mut one_shot = Zeroizing::new([0u8; LINK_KEY_LEN]);
    one_shot.copy_from_slice(key.as_slice());
    for (k, v) in one_shot.iter_mut().zip(&iv[..8]) {
        *k ^= *v;
    }

    let mut cipher = Salsa12::new(
        salsa20::Key::from_slice(one_shot.as_slice()),
        salsa20::Nonce::from_slice(&iv[8..IV_LEN]),
    );
    let mut mac_key = Zeroizing::new([0u8; 32]);
    cipher.apply_keystream(mac_key.as_mut_slice());
    (cipher, mac_key)
}

/// The batched outbound queue toward one member.
///
/// A queue is `closed` until the member is admitted to the cluster;
/// opening it (and every flush thereafter) re-seeds the header with a
/// fresh random IV and the sender/recipient ids.
pub(crate) struct FrameQueue {
    buf: Vec<u8>,
    from: MemberId,
    to: MemberId,
}

impl FrameQueue {
    /// A queue that accepts nothing; used for vacant member slots.
    pub fn closed() -> Self {
        Self {
            buf: Vec::new(),
            from: 0,
            to: 0,
        }
    }

    /// Opens a queue for the `from` → `to` link.
    pub fn open(from: MemberId, to: MemberId) -> Self {
        let mut queue = Self {
            buf: Vec::with_capacity(512),
            from,
            to,
        };
        queue.rearm();
        queue
    }

    fn rearm(&mut self) {
        self.buf.clear();
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        self.buf.extend_from_slice(&iv);
        self.buf.extend_from_slice(&[0u8; MAC_LEN]);
        self.buf.extend_from_slice(&self.from.to_be_bytes());
        self.buf.extend_from_slice(&self.to.to_be_bytes());
    }

    pub fn is_open(&self) -> bool {
        self.buf.len() >= FRAME_HEADER_LEN
    }

    pub fn has_payload(&self) -> bool {
        self.buf.len() > FRAME_HEADER_LEN
    }

    /// Whether `encoded_len` more bytes fit under [`MAX_MESSAGE_LEN`].
    pub fn fits(&self, encoded_len: usize) -> bool {
        self.buf.len() + encoded_len <= MAX_MESSAGE_LEN
    }

    /// Appends one sub-message. The caller is responsible for flushing
    /// first when the sub-message would not fit.
    pub fn append(&mut self, kind: u8, payload: &[u8]) {
        debug_assert!(self.is_open());
        let Ok(len) = u16::try_from(payload.len() + 1) else {
            return;
        };
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.push(kind);
        self.buf.extend_from_slice(payload);
    }

    /// Seals the queue and hands the finished frame to `emit`, then
    /// re-arms with a fresh IV. Does nothing if only the header is
    /// queued.
    pub fn flush<F: FnOnce(&[u8])>(&mut self, key: &LinkKey, emit: F) {
        if !self.has_payload() {
            return;
        }

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&self.buf[..IV_LEN]);
        let (mut cipher, mac_key) = one_time_cipher(key, &iv);

        cipher.apply_keystream(&mut self.buf[SEAL_OVERHEAD..]);
        let tag = Poly1305::new(poly1305::Key::from_slice(mac_key.as_slice()))
            .compute_unpadded(&self.buf[SEAL_OVERHEAD..]);
        self.buf[IV_LEN..SEAL_OVERHEAD].copy_from_slice(&tag.as_slice()[..MAC_LEN]);

        emit(&self.buf);
        self.rearm();
    }
}

/// Authenticates and decrypts one inbound frame with the local link key,
/// returning the plaintext body (sender id, recipient id, sub-messages).
pub(crate) fn unseal(frame: &[u8], key: &LinkKey) -> Result<Vec<u8>, FrameError> {
    if frame.len() < SEAL_OVERHEAD {
        return Err(FrameError::TooShort { len: frame.len() });
    }
    if frame.len() > MAX_MESSAGE_LEN {
        return Err(FrameError::TooLong { len: frame.len() });
    }

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&frame[..IV_LEN]);
    let (mut cipher, mac_key) = one_time_cipher(key, &iv);

    let tag = Poly1305::new(poly1305::Key::from_slice(mac_key.as_slice()))
        .compute_unpadded(&frame[SEAL_OVERHEAD..]);
    if !bool::from(tag.as_slice()[..MAC_LEN].ct_eq(&frame[IV_LEN..SEAL_OVERHEAD])) {
        return Err(FrameError::Mac);
    }

    let mut body = frame[SEAL_OVERHEAD..].to_vec();
    cipher.apply_keystream(&mut body);
    Ok(body)
}
