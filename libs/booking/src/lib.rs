//! Deterministic booking state machine replicated via Raft
//!
//! The domain is a movie-ticket box office: a seeded catalog, per-seat
//! holds with a payment deadline, bookings, and a per-client idempotency
//! cache. Commands and outcomes are bincode-framed serde types; applying a
//! command depends only on the store's tables and the envelope itself, so
//! every replica computes the same result.

mod command;
mod store;
mod types;

pub use command::{CodecError, Command, Envelope, Outcome, Rejection};
pub use store::TicketStore;
pub use types::{
    Booking, BookingId, BookingState, Movie, MovieId, Seat, SeatNo, SeatStatus, UserId,
};
