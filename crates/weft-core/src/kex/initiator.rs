//! Key exchange initiator state machine.
//!
//! One initiator manages one exchange with one remote endpoint. Hellos are
//! retransmitted with exponential backoff until a cookie arrives or the
//! total deadline expires. After the Initiate is sent the initiator keeps
//! retransmitting it; if no channel traffic confirms the exchange within
//! the fallback window it drops back to the hello phase, and the host
//! calls [`KexInitiator::channel_confirmed`] once the new channel
//! authenticates its first packet.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand_core::OsRng;
use tracing::{debug, warn};

use weft_crypto::boxes;
use weft_crypto::kdf::SessionKeySet;
use weft_crypto::x25519::{Keypair, PublicKey};

use crate::error::KexError;
use crate::kex::wire::{
    self, CookiePacket, HelloPacket, InitiatePacket, COOKIE_NONCE_PREFIX, COOKIE_SIZE,
    HELLO_NONCE_PREFIX, HELLO_PADDING, INITIATE_NONCE_PREFIX, VOUCH_NONCE_PREFIX,
};
use crate::timer::Timer;

/// Initial hello retransmission interval.
const RETRY_INITIAL: Duration = Duration::from_secs(1);
/// Retransmission backoff cap.
const RETRY_CAP: Duration = Duration::from_secs(60);
/// Total deadline for the whole exchange.
const KEX_DEADLINE: Duration = Duration::from_secs(300);
/// Time in the initiate phase before falling back to hello.
const INITIATE_FALLBACK: Duration = Duration::from_secs(30);

/// Phase of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    /// Constructed, nothing sent. Still cancelable.
    Idle,
    /// Hello sent, awaiting cookie.
    Hello,
    /// Initiate sent, awaiting first channel traffic.
    Initiate,
    /// Finished, successfully or not.
    Done,
}

/// What a timer poll asks the host to do.
#[derive(Debug, Default)]
pub struct InitiatorPoll {
    /// Packet to (re)send, if any.
    pub send: Option<Vec<u8>>,
    /// The exchange failed terminally.
    pub failed: bool,
}

/// Result of processing a cookie: the initiate packet to send and the
/// session keys for the new channel.
pub struct CookieOutcome {
    /// Initiate wire bytes.
    pub initiate: Vec<u8>,
    /// Derived session keys, oriented for this side.
    pub keys: SessionKeySet,
    /// Responder's short-term public key.
    pub responder_short_pk: PublicKey,
}

/// One outstanding key exchange toward one endpoint.
pub struct KexInitiator {
    target: SocketAddr,
    local_long: Keypair,
    remote_long_pk: PublicKey,
    short: Keypair,
    channel_number: u8,
    state: InitiatorState,
    early: bool,
    started_at: Instant,
    initiate_at: Option<Instant>,
    initiate_wire: Option<Vec<u8>>,
    retransmit: Timer,
    hello_attempts: u32,
}

impl KexInitiator {
    /// Construct an initiator toward `target`, which must be reachable as
    /// the holder of `remote_long_pk`. `channel_number` is the channel the
    /// stream layer allocated for the exchange.
    pub fn new(
        local_long: Keypair,
        remote_long_pk: PublicKey,
        target: SocketAddr,
        channel_number: u8,
        now: Instant,
    ) -> Self {
        Self {
            target,
            local_long,
            remote_long_pk,
            short: Keypair::generate(&mut OsRng),
            channel_number,
            state: InitiatorState::Idle,
            early: true,
            started_at: now,
            initiate_at: None,
            initiate_wire: None,
            retransmit: Timer::default(),
            hello_attempts: 0,
        }
    }

    /// Remote endpoint of this exchange.
    #[must_use]
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.target
    }

    /// Negotiated channel number.
    #[must_use]
    pub fn channel_number(&self) -> u8 {
        self.channel_number
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> InitiatorState {
        self.state
    }

    /// Whether the exchange completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == InitiatorState::Done
    }

    /// Whether the initiator can still be canceled without a failure
    /// signal (nothing sent yet).
    #[must_use]
    pub fn is_early(&self) -> bool {
        self.early
    }

    /// Number of hellos transmitted (diagnostics and tests).
    #[must_use]
    pub fn hello_attempts(&self) -> u32 {
        self.hello_attempts
    }

    /// Our short-term public key for this exchange.
    #[must_use]
    pub fn short_term_pk(&self) -> PublicKey {
        self.short.public()
    }

    /// Begin the exchange: returns the first hello to send.
    ///
    /// # Errors
    ///
    /// Fails only if the responder's long-term key is unusable.
    pub fn exchange_keys(&mut self, now: Instant) -> Result<Vec<u8>, KexError> {
        debug_assert_eq!(self.state, InitiatorState::Idle);
        self.early = false;
        self.state = InitiatorState::Hello;
        self.retransmit.start(now, RETRY_INITIAL);
        self.build_hello()
    }

    fn build_hello(&mut self) -> Result<Vec<u8>, KexError> {
        let padding = [0u8; HELLO_PADDING];
        let (nonce, sealed) = boxes::seal(
            &mut OsRng,
            self.short.secret(),
            &self.remote_long_pk,
            HELLO_NONCE_PREFIX,
            &padding,
        )?;
        self.hello_attempts += 1;
        debug!(to = %self.target, attempt = self.hello_attempts, "sending hello");
        Ok(HelloPacket {
            initiator_short_pk: self.short.public().to_bytes(),
            nonce,
            sealed: sealed.try_into().map_err(|_| KexError::Malformed)?,
        }
        .encode())
    }

    /// Process a cookie packet. Produces the initiate and the session keys.
    ///
    /// # Errors
    ///
    /// [`KexError::WrongState`] outside the hello phase (duplicate cookies
    /// are ignored this way); [`KexError::CookieRejected`] when the box
    /// does not open. Both are dropped silently at the packet level.
    pub fn got_cookie(&mut self, pkt: &CookiePacket, now: Instant) -> Result<CookieOutcome, KexError> {
        if self.state != InitiatorState::Hello {
            return Err(KexError::WrongState);
        }

        let opened = boxes::open(
            self.short.secret(),
            &self.remote_long_pk,
            COOKIE_NONCE_PREFIX,
            &pkt.nonce,
            &pkt.sealed,
        )
        .map_err(|_| KexError::CookieRejected)?;
        if opened.len() != 32 + COOKIE_SIZE {
            return Err(KexError::CookieRejected);
        }

        let responder_short_pk = PublicKey::from_bytes(wire::take(&opened));
        let cookie: [u8; COOKIE_SIZE] = wire::take(&opened[32..]);

        let keys = SessionKeySet::derive(
            self.short.secret(),
            &responder_short_pk,
            &self.short.public(),
            &responder_short_pk,
            true,
        )?;

        // Vouch: our long-term identity commits to the short-term key.
        let (vouch_nonce, vouch_box) = boxes::seal(
            &mut OsRng,
            self.local_long.secret(),
            &self.remote_long_pk,
            VOUCH_NONCE_PREFIX,
            self.short.public().as_bytes(),
        )?;

        let mut inner = Vec::with_capacity(32 + 16 + vouch_box.len() + 1);
        inner.extend_from_slice(self.local_long.public().as_bytes());
        inner.extend_from_slice(&vouch_nonce);
        inner.extend_from_slice(&vouch_box);
        inner.push(self.channel_number);

        let (nonce, sealed) = boxes::seal(
            &mut OsRng,
            self.short.secret(),
            &responder_short_pk,
            INITIATE_NONCE_PREFIX,
            &inner,
        )?;

        let initiate = InitiatePacket {
            initiator_short_pk: self.short.public().to_bytes(),
            cookie,
            nonce,
            sealed,
        }
        .encode();

        debug!(to = %self.target, "cookie accepted, sending initiate");
        self.state = InitiatorState::Initiate;
        self.initiate_at = Some(now);
        self.initiate_wire = Some(initiate.clone());
        self.retransmit.start(now, RETRY_INITIAL);

        Ok(CookieOutcome {
            initiate,
            keys,
            responder_short_pk,
        })
    }

    /// Cancel the exchange. Returns true when nothing was ever sent (a
    /// silent cancel); afterwards cancellation is equivalent to failure
    /// and the caller signals completion accordingly.
    pub fn cancel(&mut self) -> bool {
        let was_early = self.early;
        self.state = InitiatorState::Done;
        self.retransmit.stop();
        was_early
    }

    /// The new channel saw authenticated traffic: the exchange succeeded.
    pub fn channel_confirmed(&mut self) {
        if self.state == InitiatorState::Initiate {
            debug!(to = %self.target, "key exchange confirmed");
            self.state = InitiatorState::Done;
            self.retransmit.stop();
        }
    }

    /// A probe arrived from our target: retransmit the hello right away.
    pub fn probed(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.state != InitiatorState::Hello {
            return None;
        }
        self.retransmit.start(now, self.retransmit.interval);
        self.build_hello().ok()
    }

    /// Drive retransmission and deadlines.
    pub fn poll_timers(&mut self, now: Instant) -> InitiatorPoll {
        let mut poll = InitiatorPoll::default();
        if self.state == InitiatorState::Done || self.state == InitiatorState::Idle {
            return poll;
        }

        if now.saturating_duration_since(self.started_at) >= KEX_DEADLINE {
            warn!(to = %self.target, "key exchange deadline exceeded");
            self.state = InitiatorState::Done;
            self.retransmit.stop();
            poll.failed = true;
            return poll;
        }

        if !self.retransmit.expired(now) {
            return poll;
        }

        match self.state {
            InitiatorState::Hello => {
                poll.send = self.build_hello().ok();
                self.retransmit.restart_backoff(now, RETRY_CAP);
            }
            InitiatorState::Initiate => {
                let stuck = self
                    .initiate_at
                    .is_some_and(|t| now.saturating_duration_since(t) >= INITIATE_FALLBACK);
                if stuck {
                    // No channel traffic confirmed the exchange; restart
                    // from the hello phase with the same short-term key.
                    debug!(to = %self.target, "initiate unconfirmed, falling back to hello");
                    self.state = InitiatorState::Hello;
                    self.initiate_at = None;
                    self.initiate_wire = None;
                    poll.send = self.build_hello().ok();
                    self.retransmit.start(now, RETRY_INITIAL);
                } else {
                    poll.send = self.initiate_wire.clone();
                    self.retransmit.restart_backoff(now, RETRY_CAP);
                }
            }
            InitiatorState::Idle | InitiatorState::Done => {}
        }
        poll
    }

    /// Earliest instant at which `poll_timers` has work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state == InitiatorState::Done {
            None
        } else {
            self.retransmit.deadline
        }
    }
}
