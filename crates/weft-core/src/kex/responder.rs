//! Key exchange responder.
//!
//! The responder is stateless until an Initiate validates: a hello costs
//! one short-term keypair that is immediately sealed into the returned
//! cookie and forgotten, so an attacker cannot make the responder allocate
//! memory by spraying hellos. Replayed initiates are caught by a bounded
//! cookie cache that ages out with the minute key.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand_core::OsRng;
use tracing::{debug, warn};

use weft_crypto::boxes;
use weft_crypto::kdf::SessionKeySet;
use weft_crypto::minute::MinuteKeys;
use weft_crypto::x25519::{Keypair, PublicKey, SecretKey};

use crate::error::KexError;
use crate::kex::wire::{
    self, CookiePacket, HelloPacket, InitiatePacket, COOKIE_NONCE_PREFIX, HELLO_NONCE_PREFIX,
    HELLO_PADDING, INITIATE_NONCE_PREFIX, VOUCH_BOX_SIZE, VOUCH_NONCE_PREFIX,
};

/// Minute key rotation interval.
const ROTATION_INTERVAL: Duration = Duration::from_secs(60);

/// Bound on each replay-cache generation.
const REPLAY_CACHE_MAX: usize = 1 << 16;

/// A validated Initiate: everything the host needs to create the channel.
pub struct InitiateOutcome {
    /// The initiator's long-term identity key.
    pub initiator_long_pk: PublicKey,
    /// The initiator's short-term key for this session.
    pub initiator_short_pk: PublicKey,
    /// Session keys oriented for the responder side.
    pub keys: SessionKeySet,
    /// Channel number the initiator allocated for both directions.
    pub channel_number: u8,
    /// Application payload carried in the initiate, if any.
    pub payload: Vec<u8>,
}

/// The per-host key exchange responder.
pub struct KexResponder {
    minute: MinuteKeys,
    last_rotation: Instant,
    replay_current: HashSet<[u8; 32]>,
    replay_previous: HashSet<[u8; 32]>,
}

impl KexResponder {
    /// Create a responder with a fresh minute key.
    pub fn new(now: Instant) -> Self {
        Self {
            minute: MinuteKeys::generate(&mut OsRng),
            last_rotation: now,
            replay_current: HashSet::new(),
            replay_previous: HashSet::new(),
        }
    }

    /// Handle a hello. Returns the cookie packet to send, or an error to
    /// drop silently. Allocates no per-connection state.
    ///
    /// # Errors
    ///
    /// Any validation failure; the caller drops the packet without reply.
    pub fn got_hello(
        &mut self,
        pkt: &HelloPacket,
        identity: &Keypair,
    ) -> Result<Vec<u8>, KexError> {
        let initiator_short_pk = PublicKey::from_bytes(pkt.initiator_short_pk);

        let opened = boxes::open(
            identity.secret(),
            &initiator_short_pk,
            HELLO_NONCE_PREFIX,
            &pkt.nonce,
            &pkt.sealed,
        )?;
        if opened.len() != HELLO_PADDING {
            return Err(KexError::Malformed);
        }
        debug!("hello verified, sending cookie");

        // The short-term session key lives only inside the cookie.
        let session = Keypair::generate(&mut OsRng);
        let mut cookie_plain = Vec::with_capacity(64);
        cookie_plain.extend_from_slice(&pkt.initiator_short_pk);
        cookie_plain.extend_from_slice(&session.secret().to_bytes());
        let (cookie_nonce, cookie_box) = self.minute.seal(&mut OsRng, &cookie_plain)?;

        let mut outer = Vec::with_capacity(32 + 96);
        outer.extend_from_slice(session.public().as_bytes());
        outer.extend_from_slice(&cookie_nonce);
        outer.extend_from_slice(&cookie_box);

        let (nonce, sealed) = boxes::seal(
            &mut OsRng,
            identity.secret(),
            &initiator_short_pk,
            COOKIE_NONCE_PREFIX,
            &outer,
        )?;

        Ok(CookiePacket {
            nonce,
            sealed: sealed.try_into().map_err(|_| KexError::Malformed)?,
        }
        .encode())
    }

    /// Handle an initiate. On success the caller creates and starts the
    /// channel; on error the packet is dropped with no reply.
    ///
    /// # Errors
    ///
    /// [`KexError::CookieRejected`] when the cookie does not open or does
    /// not match the claimed short-term key, [`KexError::Replay`] for a
    /// captured initiate, [`KexError::VouchRejected`] when the identity
    /// vouch fails.
    pub fn got_initiate(
        &mut self,
        pkt: &InitiatePacket,
        identity: &Keypair,
    ) -> Result<InitiateOutcome, KexError> {
        // Open the cookie with the minute key.
        let cookie_nonce: [u8; 16] = wire::take(&pkt.cookie);
        let cookie_box = &pkt.cookie[16..];
        let cookie = self
            .minute
            .open(&cookie_nonce, cookie_box)
            .map_err(|_| KexError::CookieRejected)?;
        if cookie.len() != 64 {
            return Err(KexError::CookieRejected);
        }
        if cookie[..32] != pkt.initiator_short_pk {
            warn!("cookie and initiator short-term key mismatch");
            return Err(KexError::CookieRejected);
        }

        // A captured initiate must not instantiate a second channel.
        let cookie_hash: [u8; 32] = *blake3::hash(&pkt.cookie).as_bytes();
        if self.replay_current.contains(&cookie_hash) || self.replay_previous.contains(&cookie_hash)
        {
            warn!("replayed initiate dropped");
            return Err(KexError::Replay);
        }

        let session_secret = SecretKey::from_bytes(wire::take(&cookie[32..]));
        let initiator_short_pk = PublicKey::from_bytes(pkt.initiator_short_pk);

        let inner = boxes::open(
            &session_secret,
            &initiator_short_pk,
            INITIATE_NONCE_PREFIX,
            &pkt.nonce,
            &pkt.sealed,
        )?;
        if inner.len() < 32 + 16 + VOUCH_BOX_SIZE + 1 {
            return Err(KexError::Malformed);
        }

        let initiator_long_pk = PublicKey::from_bytes(wire::take(&inner));
        let vouch_nonce: [u8; 16] = wire::take(&inner[32..]);
        let vouch_box = &inner[48..48 + VOUCH_BOX_SIZE];

        let vouch = boxes::open(
            identity.secret(),
            &initiator_long_pk,
            VOUCH_NONCE_PREFIX,
            &vouch_nonce,
            vouch_box,
        )
        .map_err(|_| KexError::VouchRejected)?;
        if vouch != pkt.initiator_short_pk {
            warn!("vouch subpacket invalid");
            return Err(KexError::VouchRejected);
        }

        let payload = &inner[48 + VOUCH_BOX_SIZE..];
        let channel_number = payload[0];
        if channel_number == 0 {
            return Err(KexError::Malformed);
        }

        let session_pk = session_secret.public_key();
        let keys = SessionKeySet::derive(
            &session_secret,
            &initiator_short_pk,
            &initiator_short_pk,
            &session_pk,
            false,
        )?;

        if self.replay_current.len() >= REPLAY_CACHE_MAX {
            self.replay_current.clear();
        }
        self.replay_current.insert(cookie_hash);

        debug!(chan = channel_number, "initiate validated");
        Ok(InitiateOutcome {
            initiator_long_pk,
            initiator_short_pk,
            keys,
            channel_number,
            payload: payload[1..].to_vec(),
        })
    }

    /// Rotate the minute key (and age the replay cache) when due.
    pub fn poll_timers(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_rotation) >= ROTATION_INTERVAL {
            debug!("rotating minute key");
            self.minute.rotate(&mut OsRng);
            self.replay_previous = std::mem::take(&mut self.replay_current);
            self.last_rotation = now;
        }
    }

    /// When the next rotation is due.
    #[must_use]
    pub fn next_deadline(&self) -> Instant {
        self.last_rotation + ROTATION_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kex::initiator::KexInitiator;
    use crate::kex::wire;
    use std::time::Instant;

    fn run_exchange() -> (KexInitiator, KexResponder, Keypair, Keypair, InitiateOutcome) {
        let now = Instant::now();
        let initiator_id = Keypair::generate(&mut OsRng);
        let responder_id = Keypair::generate(&mut OsRng);
        let target: std::net::SocketAddr = "127.0.0.1:3000".parse().unwrap();

        let mut initiator =
            KexInitiator::new(initiator_id.clone(), responder_id.public(), target, 1, now);
        let mut responder = KexResponder::new(now);

        let hello_wire = initiator.exchange_keys(now).unwrap();
        let hello = HelloPacket::decode(&hello_wire).unwrap();
        let cookie_wire = responder.got_hello(&hello, &responder_id).unwrap();
        let cookie = CookiePacket::decode(&cookie_wire).unwrap();
        let outcome = initiator.got_cookie(&cookie, now).unwrap();
        let initiate = InitiatePacket::decode(&outcome.initiate).unwrap();
        let accepted = responder.got_initiate(&initiate, &responder_id).unwrap();

        // Mirror check: each side's tx is the other's rx.
        assert_eq!(outcome.keys.tx.key, accepted.keys.rx.key);
        assert_eq!(outcome.keys.rx.key, accepted.keys.tx.key);
        assert_eq!(outcome.keys.tx.channel_id, accepted.keys.rx.channel_id);

        (initiator, responder, initiator_id, responder_id, accepted)
    }

    #[test]
    fn full_exchange_derives_mirrored_keys() {
        let (initiator, _responder, initiator_id, _resp_id, accepted) = run_exchange();
        assert_eq!(accepted.channel_number, 1);
        assert_eq!(
            accepted.initiator_long_pk.to_bytes(),
            initiator_id.public().to_bytes()
        );
        assert_eq!(
            accepted.initiator_short_pk.to_bytes(),
            initiator.short_term_pk().to_bytes()
        );
    }

    #[test]
    fn replayed_initiate_rejected() {
        let now = Instant::now();
        let initiator_id = Keypair::generate(&mut OsRng);
        let responder_id = Keypair::generate(&mut OsRng);
        let target: std::net::SocketAddr = "127.0.0.1:3000".parse().unwrap();

        let mut initiator =
            KexInitiator::new(initiator_id, responder_id.public(), target, 1, now);
        let mut responder = KexResponder::new(now);

        let hello = HelloPacket::decode(&initiator.exchange_keys(now).unwrap()).unwrap();
        let cookie_wire = responder.got_hello(&hello, &responder_id).unwrap();
        let cookie = CookiePacket::decode(&cookie_wire).unwrap();
        let outcome = initiator.got_cookie(&cookie, now).unwrap();
        let initiate = InitiatePacket::decode(&outcome.initiate).unwrap();

        assert!(responder.got_initiate(&initiate, &responder_id).is_ok());
        assert!(matches!(
            responder.got_initiate(&initiate, &responder_id),
            Err(KexError::Replay)
        ));
    }

    #[test]
    fn hello_with_wrong_responder_key_rejected() {
        let now = Instant::now();
        let initiator_id = Keypair::generate(&mut OsRng);
        let responder_id = Keypair::generate(&mut OsRng);
        let wrong_id = Keypair::generate(&mut OsRng);
        let target: std::net::SocketAddr = "127.0.0.1:3000".parse().unwrap();

        // The initiator seals its hello to the wrong long-term key.
        let mut initiator = KexInitiator::new(initiator_id, wrong_id.public(), target, 1, now);
        let hello = HelloPacket::decode(&initiator.exchange_keys(now).unwrap()).unwrap();

        let mut responder = KexResponder::new(now);
        assert!(responder.got_hello(&hello, &responder_id).is_err());
    }

    #[test]
    fn responder_is_stateless_before_initiate() {
        let now = Instant::now();
        let responder_id = Keypair::generate(&mut OsRng);
        let mut responder = KexResponder::new(now);
        let target: std::net::SocketAddr = "127.0.0.1:3000".parse().unwrap();

        for i in 0..50 {
            let id = Keypair::generate(&mut OsRng);
            let mut init = KexInitiator::new(id, responder_id.public(), target, 1, now);
            let hello = HelloPacket::decode(&init.exchange_keys(now).unwrap()).unwrap();
            responder.got_hello(&hello, &responder_id).unwrap();
            let _ = i;
        }
        assert!(responder.replay_current.is_empty());
        assert!(responder.replay_previous.is_empty());
    }

    #[test]
    fn cookie_expires_after_two_rotations() {
        let now = Instant::now();
        let initiator_id = Keypair::generate(&mut OsRng);
        let responder_id = Keypair::generate(&mut OsRng);
        let target: std::net::SocketAddr = "127.0.0.1:3000".parse().unwrap();

        let mut initiator =
            KexInitiator::new(initiator_id, responder_id.public(), target, 1, now);
        let mut responder = KexResponder::new(now);

        let hello = HelloPacket::decode(&initiator.exchange_keys(now).unwrap()).unwrap();
        let cookie_wire = responder.got_hello(&hello, &responder_id).unwrap();
        let cookie = CookiePacket::decode(&cookie_wire).unwrap();
        let outcome = initiator.got_cookie(&cookie, now).unwrap();
        let initiate = InitiatePacket::decode(&outcome.initiate).unwrap();

        responder.poll_timers(now + ROTATION_INTERVAL);
        responder.poll_timers(now + ROTATION_INTERVAL * 2);
        assert!(matches!(
            responder.got_initiate(&initiate, &responder_id),
            Err(KexError::CookieRejected)
        ));
    }

    #[test]
    fn probe_packet_is_tiny_and_recognized() {
        let probe = wire::encode_probe();
        assert_eq!(wire::kex_magic(&probe), Some(wire::PROBE_MAGIC));
    }
}
