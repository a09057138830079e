//! Session key schedule.
//!
//! After the Initiate packet validates, both sides hold the two short-term
//! public keys and one X25519 agreement between them. Everything a channel
//! needs (per-direction data keys, nonce bases, and half-channel ids) is
//! derived from that agreement with BLAKE3 `derive_key`, so initiator and
//! responder compute identical values without further round trips.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::x25519::{PublicKey, SecretKey};
use crate::CryptoError;

const MASTER_CONTEXT: &str = "weft kex master v1";
const KEY_I2R_CONTEXT: &str = "weft key initiator->responder";
const KEY_R2I_CONTEXT: &str = "weft key responder->initiator";
const NONCE_I2R_CONTEXT: &str = "weft nonce base initiator->responder";
const NONCE_R2I_CONTEXT: &str = "weft nonce base responder->initiator";
const CHANID_I2R_CONTEXT: &str = "weft channel id initiator->responder";
const CHANID_R2I_CONTEXT: &str = "weft channel id responder->initiator";

/// One direction of a channel's cryptographic state.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    /// AEAD key for this direction.
    pub key: [u8; 32],
    /// 8-byte nonce base for this direction.
    pub nonce_base: [u8; 8],
    /// Half-channel id: tags USIDs created on this direction.
    pub channel_id: [u8; 8],
}

/// The full set of keys derived from one completed key exchange.
///
/// `tx`/`rx` are already oriented for the local side: the initiator's `tx`
/// equals the responder's `rx` and vice versa.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeySet {
    /// Transmit direction.
    pub tx: DirectionKeys,
    /// Receive direction.
    pub rx: DirectionKeys,
}

impl SessionKeySet {
    /// Derive the key set from the short-term agreement.
    ///
    /// `local_short` is this side's short-term secret; `remote_short_pk`
    /// the peer's short-term public key. `initiator` selects orientation.
    ///
    /// # Errors
    ///
    /// Fails if the peer's short-term key is a low-order point.
    pub fn derive(
        local_short: &SecretKey,
        remote_short_pk: &PublicKey,
        initiator_short_pk: &PublicKey,
        responder_short_pk: &PublicKey,
        initiator: bool,
    ) -> Result<Self, CryptoError> {
        let shared = local_short.exchange(remote_short_pk)?;

        let mut ikm = [0u8; 96];
        ikm[..32].copy_from_slice(shared.as_bytes());
        ikm[32..64].copy_from_slice(initiator_short_pk.as_bytes());
        ikm[64..].copy_from_slice(responder_short_pk.as_bytes());
        let mut master = blake3::derive_key(MASTER_CONTEXT, &ikm);
        ikm.zeroize();

        let i2r = direction(&master, KEY_I2R_CONTEXT, NONCE_I2R_CONTEXT, CHANID_I2R_CONTEXT);
        let r2i = direction(&master, KEY_R2I_CONTEXT, NONCE_R2I_CONTEXT, CHANID_R2I_CONTEXT);
        master.zeroize();

        Ok(if initiator {
            Self { tx: i2r, rx: r2i }
        } else {
            Self { tx: r2i, rx: i2r }
        })
    }
}

fn direction(master: &[u8; 32], key_ctx: &str, nonce_ctx: &str, chan_ctx: &str) -> DirectionKeys {
    let key = blake3::derive_key(key_ctx, master);
    let nonce_full = blake3::derive_key(nonce_ctx, master);
    let chan_full = blake3::derive_key(chan_ctx, master);

    let mut nonce_base = [0u8; 8];
    nonce_base.copy_from_slice(&nonce_full[..8]);
    let mut channel_id = [0u8; 8];
    channel_id.copy_from_slice(&chan_full[..8]);

    DirectionKeys {
        key,
        nonce_base,
        channel_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x25519::Keypair;
    use rand_core::OsRng;

    #[test]
    fn both_sides_derive_mirrored_keys() {
        let init = Keypair::generate(&mut OsRng);
        let resp = Keypair::generate(&mut OsRng);

        let a = SessionKeySet::derive(
            init.secret(),
            &resp.public(),
            &init.public(),
            &resp.public(),
            true,
        )
        .unwrap();
        let b = SessionKeySet::derive(
            resp.secret(),
            &init.public(),
            &init.public(),
            &resp.public(),
            false,
        )
        .unwrap();

        assert_eq!(a.tx.key, b.rx.key);
        assert_eq!(a.rx.key, b.tx.key);
        assert_eq!(a.tx.nonce_base, b.rx.nonce_base);
        assert_eq!(a.tx.channel_id, b.rx.channel_id);
        assert_eq!(a.rx.channel_id, b.tx.channel_id);
        assert_ne!(a.tx.key, a.rx.key);
    }
}
