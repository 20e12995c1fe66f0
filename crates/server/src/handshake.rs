//! Clock-sync handshake.
//!
//! The server sends `{nonce, server_time, 0}`. The client answers with its
//! own clock and latency estimate. When the server's clock minus the
//! client's estimate lands inside the convergence window the handshake is
//! done; otherwise the server re-estimates the one-way delay and asks again.

use crate::dispatch::{PacketContext, PacketHandler};
use async_trait::async_trait;
use emberlink_net::protocol::Handshake;
use thiserror::Error;
use tracing::warn;

/// Largest accepted clock difference, in milliseconds.
pub const CONVERGENCE_WINDOW_MS: i64 = 50;

/// Handshake reply that must close the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// A reply arrived while no handshake was running.
    #[error("handshake reply received outside a handshake")]
    NotInProgress,

    /// The reply echoed the wrong nonce.
    #[error("handshake nonce mismatch: expected {expected:#010x}, received {received:#010x}")]
    NonceMismatch {
        /// Nonce sent by the server.
        expected: u32,
        /// Nonce in the reply.
        received: u32,
    },

    /// The client never converged.
    #[error("handshake did not converge after {attempts} attempts")]
    TooManyAttempts {
        /// Replies processed.
        attempts: u32,
    },
}

/// What to do after a valid reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Clocks agree; the handshake is over.
    Converged {
        /// Resends it took.
        attempts: u32,
        /// Final clock difference in milliseconds.
        difference: i64,
    },
    /// Send this packet and wait for another reply.
    Resend(Handshake),
}

/// Per-connection handshake bookkeeping.
#[derive(Debug, Clone)]
pub struct HandshakeState {
    nonce: u32,
    active: bool,
    last_sent_at: u32,
    attempts: u32,
    max_attempts: u32,
}

impl HandshakeState {
    /// Idle state. `max_attempts` of zero disables the cap.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            nonce: 0,
            active: false,
            last_sent_at: 0,
            attempts: 0,
            max_attempts,
        }
    }

    /// Whether a handshake is running.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Non-converged replies so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start a handshake and return the opening packet.
    pub fn begin(&mut self, nonce: u32, now: u32) -> Handshake {
        self.nonce = nonce;
        self.active = true;
        self.last_sent_at = now;
        self.attempts = 0;
        Handshake {
            handshake: nonce,
            time: now,
            delta: 0,
        }
    }

    /// Judge a reply received at `now`.
    ///
    /// Rejected replies leave the state untouched unless the attempt cap is
    /// hit, which ends the handshake.
    pub fn on_reply(&mut self, reply: &Handshake, now: u32) -> Result<HandshakeStep, HandshakeError> {
        if !self.active {
            return Err(HandshakeError::NotInProgress);
        }
        if reply.handshake != self.nonce {
            return Err(HandshakeError::NonceMismatch {
                expected: self.nonce,
                received: reply.handshake,
            });
        }

        let now_ms = i64::from(now);
        let difference = now_ms - (i64::from(reply.time) + i64::from(reply.delta));
        if (0..=CONVERGENCE_WINDOW_MS).contains(&difference) {
            self.active = false;
            return Ok(HandshakeStep::Converged {
                attempts: self.attempts,
                difference,
            });
        }

        self.attempts += 1;
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            self.active = false;
            return Err(HandshakeError::TooManyAttempts {
                attempts: self.attempts,
            });
        }

        let mut delta = (now_ms - i64::from(reply.time)) / 2;
        if delta < 0 {
            // Client clock ran backwards; estimate from our own send time.
            delta = (now_ms - i64::from(self.last_sent_at)) / 2;
        }
        let delta = u32::try_from(delta.max(0)).unwrap_or(u32::MAX);
        self.last_sent_at = now;
        Ok(HandshakeStep::Resend(Handshake {
            handshake: self.nonce,
            time: now,
            delta,
        }))
    }
}

/// Built-in handler for handshake replies.
pub(crate) struct HandshakeHandler;

#[async_trait]
impl PacketHandler<Handshake> for HandshakeHandler {
    async fn handle(&self, ctx: &mut PacketContext<Handshake>) -> anyhow::Result<()> {
        let (connection, reply) = ctx.parts()?;
        if let Err(err) = connection.handle_handshake(reply) {
            warn!(connection = %connection.id(), %err, "handshake rejected");
            connection.close(crate::CloseReason::ProtocolViolation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Client that adopts `time + delta` as its clock and echoes the delta,
    /// over a link taking `latency` ms each way. Returns the reply and the
    /// server time it arrives at.
    fn client_reply(request: &Handshake, latency: u32) -> (Handshake, u32) {
        let reply = Handshake {
            handshake: request.handshake,
            time: request.time + request.delta,
            delta: request.delta,
        };
        (reply, request.time + 2 * latency)
    }

    #[test]
    fn immediate_convergence() {
        let mut state = HandshakeState::new(32);
        let request = state.begin(0xABCD, 1_000);
        assert!(state.is_active());

        let reply = Handshake {
            handshake: 0xABCD,
            time: 1_010,
            delta: 0,
        };
        assert_eq!(
            state.on_reply(&reply, 1_030),
            Ok(HandshakeStep::Converged {
                attempts: 0,
                difference: 20
            })
        );
        assert!(!state.is_active());
        assert_eq!(request.delta, 0);
    }

    #[test]
    fn window_edges() {
        let mut state = HandshakeState::new(0);
        state.begin(1, 0);
        let at = |time| Handshake {
            handshake: 1,
            time,
            delta: 0,
        };
        assert!(matches!(state.on_reply(&at(1_000), 1_050), Ok(HandshakeStep::Converged { difference: 50, .. })));

        state.begin(1, 0);
        assert!(matches!(state.on_reply(&at(1_000), 1_051), Ok(HandshakeStep::Resend(_))));
        assert!(matches!(state.on_reply(&at(1_000), 1_000), Ok(HandshakeStep::Converged { difference: 0, .. })));

        state.begin(1, 0);
        assert!(matches!(state.on_reply(&at(1_001), 1_000), Ok(HandshakeStep::Resend(_))));
    }

    #[test]
    fn resend_halves_round_trip() {
        let mut state = HandshakeState::new(32);
        state.begin(7, 1_000);
        let reply = Handshake {
            handshake: 7,
            time: 900,
            delta: 0,
        };
        assert_eq!(
            state.on_reply(&reply, 1_200),
            Ok(HandshakeStep::Resend(Handshake {
                handshake: 7,
                time: 1_200,
                delta: 150
            }))
        );
        assert_eq!(state.attempts(), 1);
        assert!(state.is_active());
    }

    #[test]
    fn backwards_client_clock_uses_last_send_time() {
        let mut state = HandshakeState::new(32);
        state.begin(7, 1_000);
        // Client claims a time in our future, far outside the window.
        let reply = Handshake {
            handshake: 7,
            time: 5_000,
            delta: 0,
        };
        let step = state.on_reply(&reply, 1_100).unwrap();
        assert_eq!(
            step,
            HandshakeStep::Resend(Handshake {
                handshake: 7,
                time: 1_100,
                delta: 50
            })
        );
    }

    #[test]
    fn simulated_client_converges() {
        let mut state = HandshakeState::new(32);
        let mut request = state.begin(0x1234_5678, 10_000);
        for _ in 0..8 {
            let (reply, now) = client_reply(&request, 90);
            match state.on_reply(&reply, now).unwrap() {
                HandshakeStep::Converged {
                    attempts,
                    difference,
                } => {
                    assert_eq!(attempts, 1);
                    assert!((0..=CONVERGENCE_WINDOW_MS).contains(&difference));
                    return;
                }
                HandshakeStep::Resend(next) => {
                    assert_eq!(next.delta, 90);
                    request = next;
                }
            }
        }
        panic!("handshake did not converge");
    }

    #[test]
    fn nonce_mismatch_leaves_state_alone() {
        let mut state = HandshakeState::new(32);
        state.begin(1, 0);
        let reply = Handshake {
            handshake: 2,
            time: 0,
            delta: 0,
        };
        assert_eq!(
            state.on_reply(&reply, 0),
            Err(HandshakeError::NonceMismatch {
                expected: 1,
                received: 2
            })
        );
        assert!(state.is_active());
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn reply_outside_handshake_is_rejected() {
        let mut state = HandshakeState::new(32);
        let reply = Handshake {
            handshake: 0,
            time: 0,
            delta: 0,
        };
        assert_eq!(state.on_reply(&reply, 0), Err(HandshakeError::NotInProgress));

        state.begin(0, 0);
        state.on_reply(&reply, 10).unwrap();
        assert_eq!(state.on_reply(&reply, 10), Err(HandshakeError::NotInProgress));
    }

    #[test]
    fn attempt_cap_ends_handshake() {
        let mut state = HandshakeState::new(3);
        state.begin(9, 0);
        let far = Handshake {
            handshake: 9,
            time: 0,
            delta: 0,
        };
        assert!(matches!(state.on_reply(&far, 1_000), Ok(HandshakeStep::Resend(_))));
        assert!(matches!(state.on_reply(&far, 2_000), Ok(HandshakeStep::Resend(_))));
        assert_eq!(
            state.on_reply(&far, 3_000),
            Err(HandshakeError::TooManyAttempts { attempts: 3 })
        );
        assert!(!state.is_active());
    }
}
