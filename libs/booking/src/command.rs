//! Wire format for replicated booking commands
//!
//! Every command travels in an [`Envelope`] stamped by the proposing node:
//! the idempotency key and the apply-time timestamp are fixed at propose
//! time, so applying the entry is deterministic on every replica.

use crate::types::{BookingId, Movie, MovieId, SeatNo, UserId};
use serde::{Deserialize, Serialize};

/// A booking command as stored in the Raft log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Install the movie catalog; a no-op on a non-empty store
    SeedMovies { movies: Vec<Movie> },

    /// Atomically place a hold on a set of seats
    HoldSeats {
        user_id: UserId,
        movie_id: MovieId,
        seats: Vec<SeatNo>,
        ttl_ms: u64,
    },

    /// Convert a pending hold into a paid booking
    ConfirmPayment {
        booking_id: BookingId,
        method: String,
    },

    /// Cancel a pending or paid booking, releasing its seats
    CancelBooking {
        booking_id: BookingId,
        user_id: UserId,
    },

    /// Release all holds whose deadline has passed (leader-proposed sweep)
    ExpireHolds,
}

/// Envelope around a command, carrying everything the state machine may
/// depend on besides its own tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Client that issued the request
    pub client_id: String,

    /// Client-assigned sequence number; the pair with `client_id` is the
    /// idempotency key
    pub request_seq: u64,

    /// Wall-clock time at the proposing leader. Replicas never read their
    /// own clocks while applying.
    pub applied_at_ms: u64,

    pub command: Command,
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("envelope serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Envelope(e.to_string()))
    }
}

/// Why a command did not take effect
///
/// Rejections are values, not errors: they replicate, apply and cache
/// exactly like successful outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    /// At least one requested seat is not available
    SeatUnavailable,

    /// Payment attempted on a booking that is not pending
    NotPending,

    /// The hold deadline passed before payment
    HoldExpired,

    /// Booking belongs to a different user
    NotOwner,

    /// Booking is already cancelled
    NotCancellable,

    /// Unknown movie or booking
    NotFound,

    /// Command bytes did not decode
    Malformed,
}

/// Result of applying a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// Catalog installed (`movies` is 0 when the store was already seeded)
    Seeded { movies: u32 },

    /// Seats held; payment due before the hold expires
    Held { booking_id: BookingId, total: u64 },

    /// Payment accepted
    Confirmed { confirmation: String },

    /// Booking cancelled and its seats released
    Cancelled,

    /// Expiry sweep finished
    HoldsExpired { bookings: u32 },

    Rejected(Rejection),
}

impl Outcome {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("outcome serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Outcome(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("undecodable envelope: {0}")]
    Envelope(String),

    #[error("undecodable outcome: {0}")]
    Outcome(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_command() -> impl Strategy<Value = Command> {
        prop_oneof![
            prop::collection::vec(
                ("[a-z]{1,8}", "[A-Za-z ]{1,16}", 1u32..500, 1u64..10_000).prop_map(
                    |(id, title, total_seats, price)| Movie {
                        id,
                        title,
                        total_seats,
                        price,
                    }
                ),
                0..4
            )
            .prop_map(|movies| Command::SeedMovies { movies }),
            (
                "[a-z]{1,8}",
                "[a-z]{1,8}",
                prop::collection::vec(1u32..500, 1..6),
                1u64..600_000
            )
                .prop_map(|(user_id, movie_id, seats, ttl_ms)| Command::HoldSeats {
                    user_id,
                    movie_id,
                    seats,
                    ttl_ms,
                }),
            ("B[0-9]{1,6}", "[a-z]{2,10}").prop_map(|(booking_id, method)| {
                Command::ConfirmPayment { booking_id, method }
            }),
            ("B[0-9]{1,6}", "[a-z]{1,8}").prop_map(|(booking_id, user_id)| {
                Command::CancelBooking {
                    booking_id,
                    user_id,
                }
            }),
            Just(Command::ExpireHolds),
        ]
    }

    proptest! {
        /// serialize -> deserialize -> serialize is bit-identical
        #[test]
        fn envelope_roundtrip_is_stable(
            client_id in "[a-z0-9]{1,12}",
            request_seq in 0u64..u64::MAX,
            applied_at_ms in 0u64..u64::MAX,
            command in arb_command(),
        ) {
            let envelope = Envelope { client_id, request_seq, applied_at_ms, command };
            let bytes = envelope.encode();
            let decoded = Envelope::decode(&bytes).unwrap();
            prop_assert_eq!(&decoded, &envelope);
            prop_assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn outcome_roundtrip() {
        let outcomes = vec![
            Outcome::Seeded { movies: 3 },
            Outcome::Held {
                booking_id: "B1".into(),
                total: 20,
            },
            Outcome::Confirmed {
                confirmation: "PAY-B1-card".into(),
            },
            Outcome::Cancelled,
            Outcome::HoldsExpired { bookings: 2 },
            Outcome::Rejected(Rejection::SeatUnavailable),
        ];
        for outcome in outcomes {
            let bytes = outcome.encode();
            assert_eq!(Outcome::decode(&bytes).unwrap(), outcome);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Envelope::decode(b"garbage").is_err());
    }
}
