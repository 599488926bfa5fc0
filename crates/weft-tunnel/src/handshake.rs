//! Connection handshake and per-direction frame sealing.
//!
//! Both sides exchange an ephemeral X25519 key, derive two directional
//! XChaCha20-Poly1305 keys with HKDF-SHA256 salted by the shared token, and
//! then prove possession by sealing their own node id. A peer holding a
//! different token derives different keys and fails the confirm step.

use chacha20poly1305::{
    aead::{rand_core::OsRng, Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::frame::{read_framed, write_framed};
use crate::{TunnelError, PROTOCOL_VERSION};

const INFO_INITIATOR: &[u8] = b"weft-tunnel-v1 initiator->responder";
const INFO_RESPONDER: &[u8] = b"weft-tunnel-v1 responder->initiator";

/// Handshake records are tiny; anything bigger is garbage.
const HANDSHAKE_MAX: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum HandshakeMessage {
    Hello {
        version: u8,
        node_id: String,
        public_key: [u8; 32],
    },
    Confirm {
        #[serde(with = "serde_bytes")]
        sealed: Vec<u8>,
    },
    Reject {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Responder,
}

/// Outcome of a successful handshake.
pub(crate) struct Established {
    pub remote_id: String,
    pub sealing: SealingKey,
    pub opening: OpeningKey,
}

// ── Keys ────────────────────────────────────────────────────────────────

fn nonce_for(counter: u64) -> XNonce {
    let mut bytes = [0u8; 24];
    bytes[..8].copy_from_slice(&counter.to_le_bytes());
    XNonce::from(bytes)
}

/// Outbound direction key. The nonce is a message counter.
pub(crate) struct SealingKey {
    cipher: XChaCha20Poly1305,
    counter: u64,
}

impl SealingKey {
    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let nonce = nonce_for(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| TunnelError::Crypto("nonce space exhausted".into()))?;
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| TunnelError::Crypto(format!("seal failed: {e}")))
    }
}

/// Inbound direction key. Expects counters in order.
pub(crate) struct OpeningKey {
    cipher: XChaCha20Poly1305,
    counter: u64,
}

impl OpeningKey {
    pub(crate) fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let nonce = nonce_for(self.counter);
        let plaintext = self
            .cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| TunnelError::Crypto("frame authentication failed".into()))?;
        self.counter = self.counter.wrapping_add(1);
        Ok(plaintext)
    }
}

fn derive_keys(
    shared_secret: &[u8; 32],
    token: &str,
    role: Role,
) -> Result<(SealingKey, OpeningKey), TunnelError> {
    let salt = Sha256::digest(token.as_bytes());
    let hkdf = Hkdf::<Sha256>::new(Some(salt.as_slice()), shared_secret);

    let mut i2r = [0u8; 32];
    let mut r2i = [0u8; 32];
    hkdf.expand(INFO_INITIATOR, &mut i2r)
        .map_err(|e| TunnelError::Crypto(format!("key derivation failed: {e}")))?;
    hkdf.expand(INFO_RESPONDER, &mut r2i)
        .map_err(|e| TunnelError::Crypto(format!("key derivation failed: {e}")))?;

    let (seal, open) = match role {
        Role::Initiator => (i2r, r2i),
        Role::Responder => (r2i, i2r),
    };
    Ok((
        SealingKey {
            cipher: XChaCha20Poly1305::new(&seal.into()),
            counter: 0,
        },
        OpeningKey {
            cipher: XChaCha20Poly1305::new(&open.into()),
            counter: 0,
        },
    ))
}

// ── Exchange ────────────────────────────────────────────────────────────

async fn send<S>(stream: &mut S, message: &HandshakeMessage) -> Result<(), TunnelError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    write_framed(stream, &rmp_serde::to_vec(message)?).await
}

async fn recv<S>(stream: &mut S) -> Result<HandshakeMessage, TunnelError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let bytes = read_framed(stream, HANDSHAKE_MAX).await?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

/// Run the handshake over a freshly opened physical stream.
///
/// `peer` labels the remote end (usually its address) in errors.
pub(crate) async fn perform<S>(
    stream: &mut S,
    local_id: &str,
    token: &str,
    role: Role,
    peer: &str,
) -> Result<Established, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let hello = HandshakeMessage::Hello {
        version: PROTOCOL_VERSION,
        node_id: local_id.to_string(),
        public_key: PublicKey::from(&secret).to_bytes(),
    };

    let remote = match role {
        Role::Initiator => {
            send(stream, &hello).await?;
            recv(stream).await?
        }
        Role::Responder => {
            let remote = recv(stream).await?;
            send(stream, &hello).await?;
            remote
        }
    };

    let (remote_id, remote_key) = match remote {
        HandshakeMessage::Hello {
            version,
            node_id,
            public_key,
        } => {
            if version != PROTOCOL_VERSION {
                let reason = format!("unsupported protocol version {version}");
                let _ = send(stream, &HandshakeMessage::Reject { reason: reason.clone() }).await;
                return Err(TunnelError::Handshake(reason));
            }
            (node_id, PublicKey::from(public_key))
        }
        HandshakeMessage::Reject { reason } => {
            return Err(TunnelError::Auth {
                peer: peer.to_string(),
                reason,
            })
        }
        HandshakeMessage::Confirm { .. } => {
            return Err(TunnelError::Handshake("expected hello, got confirm".into()))
        }
    };

    let shared = secret.diffie_hellman(&remote_key);
    if !shared.was_contributory() {
        return Err(TunnelError::Crypto("non-contributory key exchange".into()));
    }
    let (mut sealing, mut opening) = derive_keys(shared.as_bytes(), token, role)?;

    let auth_failed = |reason: &str| TunnelError::Auth {
        peer: format!("{remote_id}@{peer}"),
        reason: reason.to_string(),
    };

    let confirm = HandshakeMessage::Confirm {
        sealed: sealing.seal(local_id.as_bytes())?,
    };

    match role {
        Role::Initiator => {
            send(stream, &confirm).await?;
            match recv(stream).await? {
                HandshakeMessage::Confirm { sealed } => {
                    verify(&mut opening, &sealed, &remote_id).map_err(|_| auth_failed("token mismatch"))?;
                }
                HandshakeMessage::Reject { reason } => return Err(auth_failed(&reason)),
                HandshakeMessage::Hello { .. } => {
                    return Err(TunnelError::Handshake("unexpected second hello".into()))
                }
            }
        }
        Role::Responder => {
            let verified = match recv(stream).await? {
                HandshakeMessage::Confirm { sealed } => verify(&mut opening, &sealed, &remote_id),
                _ => Err(()),
            };
            if verified.is_err() {
                let _ = send(
                    stream,
                    &HandshakeMessage::Reject {
                        reason: "authentication failed".into(),
                    },
                )
                .await;
                return Err(auth_failed("token mismatch"));
            }
            send(stream, &confirm).await?;
        }
    }

    Ok(Established {
        remote_id,
        sealing,
        opening,
    })
}

fn verify(opening: &mut OpeningKey, sealed: &[u8], remote_id: &str) -> Result<(), ()> {
    match opening.open(sealed) {
        Ok(plain) if plain == remote_id.as_bytes() => Ok(()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_pair(
        token_a: &str,
        token_b: &str,
    ) -> (
        Result<Established, TunnelError>,
        Result<Established, TunnelError>,
    ) {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let token_a = token_a.to_string();
        let token_b = token_b.to_string();
        let initiator = tokio::spawn(async move {
            perform(&mut a, "a1", &token_a, Role::Initiator, "b-addr").await
        });
        let responder = tokio::spawn(async move {
            perform(&mut b, "b1", &token_b, Role::Responder, "a-addr").await
        });
        (initiator.await.unwrap(), responder.await.unwrap())
    }

    #[tokio::test]
    async fn matching_tokens_establish() {
        let (a, b) = run_pair("secret", "secret").await;
        let mut a = a.unwrap();
        let mut b = b.unwrap();
        assert_eq!(a.remote_id, "b1");
        assert_eq!(b.remote_id, "a1");

        // Directional keys line up: what A seals, B opens.
        let sealed = a.sealing.seal(b"frame-1").unwrap();
        assert_eq!(b.opening.open(&sealed).unwrap(), b"frame-1");
        let sealed = b.sealing.seal(b"frame-2").unwrap();
        assert_eq!(a.opening.open(&sealed).unwrap(), b"frame-2");
    }

    #[tokio::test]
    async fn token_mismatch_is_auth_on_both_sides() {
        let (a, b) = run_pair("secret", "other").await;
        assert!(a.err().unwrap().is_auth());
        assert!(b.err().unwrap().is_auth());
    }

    #[tokio::test]
    async fn replayed_frame_rejected() {
        let (a, b) = run_pair("secret", "secret").await;
        let mut a = a.unwrap();
        let mut b = b.unwrap();
        let sealed = a.sealing.seal(b"once").unwrap();
        assert!(b.opening.open(&sealed).is_ok());
        assert!(matches!(b.opening.open(&sealed), Err(TunnelError::Crypto(_))));
    }
}
