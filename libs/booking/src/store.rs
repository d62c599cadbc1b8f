//! The deterministic booking state machine
//!
//! All maps are ordered so that every replica walks them identically, and
//! nothing in here reads a clock: time only enters through the envelope's
//! `applied_at_ms`, stamped by the proposing leader.

use crate::command::{Command, Envelope, Outcome, Rejection};
use crate::types::{
    Booking, BookingId, BookingState, Movie, MovieId, Seat, SeatNo, SeatStatus, UserId,
};
use std::collections::{BTreeMap, VecDeque};
use ticketbox_consensus::StateMachine;
use tracing::{debug, warn};

/// Cached results for one client, oldest first
#[derive(Debug, Default)]
struct ClientWindow {
    results: VecDeque<(u64, Outcome)>,
}

impl ClientWindow {
    fn lookup(&self, request_seq: u64) -> Option<&Outcome> {
        self.results
            .iter()
            .find(|(seq, _)| *seq == request_seq)
            .map(|(_, outcome)| outcome)
    }

    fn record(&mut self, request_seq: u64, outcome: Outcome, capacity: usize) {
        self.results.push_back((request_seq, outcome));
        while self.results.len() > capacity {
            self.results.pop_front();
        }
    }
}

/// Replicated booking state: movies, seats, bookings and the per-client
/// idempotency cache
#[derive(Debug)]
pub struct TicketStore {
    movies: BTreeMap<MovieId, Movie>,
    seats: BTreeMap<(MovieId, SeatNo), Seat>,
    bookings: BTreeMap<BookingId, Booking>,
    user_bookings: BTreeMap<UserId, Vec<BookingId>>,
    applied: BTreeMap<String, ClientWindow>,
    next_booking_no: u64,
    cache_capacity: usize,
}

impl TicketStore {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            movies: BTreeMap::new(),
            seats: BTreeMap::new(),
            bookings: BTreeMap::new(),
            user_bookings: BTreeMap::new(),
            applied: BTreeMap::new(),
            next_booking_no: 1,
            cache_capacity: cache_capacity.max(1),
        }
    }

    /// Apply one envelope, consulting the idempotency cache first
    pub fn apply_envelope(&mut self, envelope: &Envelope) -> Outcome {
        if let Some(cached) = self
            .applied
            .get(&envelope.client_id)
            .and_then(|window| window.lookup(envelope.request_seq))
        {
            debug!(
                client = %envelope.client_id,
                seq = envelope.request_seq,
                "replayed request served from cache"
            );
            return cached.clone();
        }

        let outcome = self.execute(&envelope.command, envelope.applied_at_ms);

        self.applied
            .entry(envelope.client_id.clone())
            .or_default()
            .record(envelope.request_seq, outcome.clone(), self.cache_capacity);

        outcome
    }

    fn execute(&mut self, command: &Command, applied_at_ms: u64) -> Outcome {
        match command {
            Command::SeedMovies { movies } => self.seed_movies(movies),
            Command::HoldSeats {
                user_id,
                movie_id,
                seats,
                ttl_ms,
            } => self.hold_seats(user_id, movie_id, seats, *ttl_ms, applied_at_ms),
            Command::ConfirmPayment { booking_id, method } => {
                self.confirm_payment(booking_id, method, applied_at_ms)
            }
            Command::CancelBooking {
                booking_id,
                user_id,
            } => self.cancel_booking(booking_id, user_id),
            Command::ExpireHolds => self.expire_holds(applied_at_ms),
        }
    }

    fn seed_movies(&mut self, movies: &[Movie]) -> Outcome {
        if !self.movies.is_empty() {
            return Outcome::Seeded { movies: 0 };
        }

        for movie in movies {
            for seat_no in 1..=movie.total_seats {
                self.seats.insert(
                    (movie.id.clone(), seat_no),
                    Seat {
                        movie_id: movie.id.clone(),
                        seat_no,
                        status: SeatStatus::Available,
                        holder: None,
                        expires_at_ms: None,
                    },
                );
            }
            self.movies.insert(movie.id.clone(), movie.clone());
        }

        debug!(count = movies.len(), "seeded movie catalog");
        Outcome::Seeded {
            movies: movies.len() as u32,
        }
    }

    fn hold_seats(
        &mut self,
        user_id: &UserId,
        movie_id: &MovieId,
        seats: &[SeatNo],
        ttl_ms: u64,
        applied_at_ms: u64,
    ) -> Outcome {
        let movie = match self.movies.get(movie_id) {
            Some(movie) => movie.clone(),
            None => return Outcome::Rejected(Rejection::NotFound),
        };

        let mut wanted: Vec<SeatNo> = seats.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        if wanted.is_empty() {
            return Outcome::Rejected(Rejection::SeatUnavailable);
        }

        // All or nothing: check every seat before touching any. A seat
        // number that was never seeded is unknown, not merely occupied.
        for &seat_no in &wanted {
            match self.seats.get(&(movie_id.clone(), seat_no)) {
                Some(seat) if seat.status == SeatStatus::Available => {}
                Some(_) => return Outcome::Rejected(Rejection::SeatUnavailable),
                None => return Outcome::Rejected(Rejection::NotFound),
            }
        }

        let booking_id = format!("B{}", self.next_booking_no);
        self.next_booking_no += 1;

        let expires_at_ms = applied_at_ms + ttl_ms;
        for &seat_no in &wanted {
            if let Some(seat) = self.seats.get_mut(&(movie_id.clone(), seat_no)) {
                seat.status = SeatStatus::Held;
                seat.holder = Some(user_id.clone());
                seat.expires_at_ms = Some(expires_at_ms);
            }
        }

        let total = movie.price * wanted.len() as u64;
        self.bookings.insert(
            booking_id.clone(),
            Booking {
                id: booking_id.clone(),
                user_id: user_id.clone(),
                movie_id: movie_id.clone(),
                seats: wanted,
                total,
                state: BookingState::Pending,
                created_at_ms: applied_at_ms,
                hold_expires_at_ms: expires_at_ms,
            },
        );
        self.user_bookings
            .entry(user_id.clone())
            .or_default()
            .push(booking_id.clone());

        debug!(booking = %booking_id, user = %user_id, total, "seats held");
        Outcome::Held { booking_id, total }
    }

    fn confirm_payment(
        &mut self,
        booking_id: &BookingId,
        method: &str,
        applied_at_ms: u64,
    ) -> Outcome {
        let booking = match self.bookings.get(booking_id) {
            Some(booking) => booking.clone(),
            None => return Outcome::Rejected(Rejection::NotFound),
        };

        match booking.state {
            BookingState::Paid | BookingState::Cancelled => {
                return Outcome::Rejected(Rejection::NotPending)
            }
            BookingState::Pending => {}
        }

        if applied_at_ms > booking.hold_expires_at_ms {
            // Too late; release now rather than wait for the next sweep
            self.release_booking(booking_id);
            return Outcome::Rejected(Rejection::HoldExpired);
        }

        for &seat_no in &booking.seats {
            if let Some(seat) = self.seats.get_mut(&(booking.movie_id.clone(), seat_no)) {
                seat.status = SeatStatus::Booked;
                seat.expires_at_ms = None;
            }
        }
        if let Some(booking) = self.bookings.get_mut(booking_id) {
            booking.state = BookingState::Paid;
        }

        debug!(booking = %booking_id, method, "payment confirmed");
        Outcome::Confirmed {
            confirmation: format!("PAY-{booking_id}-{method}"),
        }
    }

    fn cancel_booking(&mut self, booking_id: &BookingId, user_id: &UserId) -> Outcome {
        let booking = match self.bookings.get(booking_id) {
            Some(booking) => booking.clone(),
            None => return Outcome::Rejected(Rejection::NotFound),
        };

        if booking.user_id != *user_id {
            return Outcome::Rejected(Rejection::NotOwner);
        }
        if booking.state == BookingState::Cancelled {
            return Outcome::Rejected(Rejection::NotCancellable);
        }

        self.release_booking(booking_id);
        debug!(booking = %booking_id, "booking cancelled");
        Outcome::Cancelled
    }

    fn expire_holds(&mut self, applied_at_ms: u64) -> Outcome {
        let expired: Vec<BookingId> = self
            .bookings
            .values()
            .filter(|b| b.state == BookingState::Pending && applied_at_ms > b.hold_expires_at_ms)
            .map(|b| b.id.clone())
            .collect();

        for booking_id in &expired {
            self.release_booking(booking_id);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "expired stale holds");
        }
        Outcome::HoldsExpired {
            bookings: expired.len() as u32,
        }
    }

    /// Release a booking's seats and mark it cancelled
    fn release_booking(&mut self, booking_id: &BookingId) {
        let booking = match self.bookings.get_mut(booking_id) {
            Some(booking) => booking,
            None => return,
        };
        booking.state = BookingState::Cancelled;
        let movie_id = booking.movie_id.clone();
        let seats = booking.seats.clone();

        for seat_no in seats {
            if let Some(seat) = self.seats.get_mut(&(movie_id.clone(), seat_no)) {
                // A booked-then-cancelled seat releases the same way a hold does
                seat.status = SeatStatus::Available;
                seat.holder = None;
                seat.expires_at_ms = None;
            }
        }
    }

    // ----- read side -------------------------------------------------------

    pub fn movies(&self) -> Vec<Movie> {
        self.movies.values().cloned().collect()
    }

    pub fn booking(&self, booking_id: &str) -> Option<&Booking> {
        self.bookings.get(booking_id)
    }

    pub fn bookings_for(&self, user_id: &str) -> Vec<Booking> {
        self.user_bookings
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.bookings.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn seat(&self, movie_id: &str, seat_no: SeatNo) -> Option<&Seat> {
        self.seats.get(&(movie_id.to_string(), seat_no))
    }

    /// Seats of a movie that are held or booked
    pub fn occupied_seats(&self, movie_id: &str) -> usize {
        self.seats
            .values()
            .filter(|s| s.movie_id == movie_id && s.status != SeatStatus::Available)
            .count()
    }
}

impl StateMachine for TicketStore {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let outcome = match Envelope::decode(command) {
            Ok(envelope) => self.apply_envelope(&envelope),
            Err(e) => {
                warn!(error = %e, "dropping undecodable command");
                Outcome::Rejected(Rejection::Malformed)
            }
        };
        outcome.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> TicketStore {
        let mut store = TicketStore::new(16);
        let outcome = store.apply_envelope(&envelope(
            "seeder",
            1,
            1_000,
            Command::SeedMovies {
                movies: vec![Movie {
                    id: "m1".into(),
                    title: "A".into(),
                    total_seats: 3,
                    price: 10,
                }],
            },
        ));
        assert_eq!(outcome, Outcome::Seeded { movies: 1 });
        store
    }

    fn envelope(client: &str, seq: u64, at_ms: u64, command: Command) -> Envelope {
        Envelope {
            client_id: client.into(),
            request_seq: seq,
            applied_at_ms: at_ms,
            command,
        }
    }

    fn hold(user: &str, seats: &[SeatNo]) -> Command {
        Command::HoldSeats {
            user_id: user.into(),
            movie_id: "m1".into(),
            seats: seats.to_vec(),
            ttl_ms: 5_000,
        }
    }

    #[test]
    fn seeding_is_idempotent() {
        let mut store = seeded_store();
        let outcome = store.apply_envelope(&envelope(
            "seeder",
            2,
            2_000,
            Command::SeedMovies {
                movies: vec![Movie {
                    id: "m2".into(),
                    title: "B".into(),
                    total_seats: 5,
                    price: 20,
                }],
            },
        ));
        assert_eq!(outcome, Outcome::Seeded { movies: 0 });
        assert_eq!(store.movies().len(), 1);
    }

    #[test]
    fn holds_are_atomic_and_stamped() {
        let mut store = seeded_store();

        let outcome = store.apply_envelope(&envelope("c1", 1, 2_000, hold("u1", &[1, 2])));
        assert_eq!(
            outcome,
            Outcome::Held {
                booking_id: "B1".into(),
                total: 20
            }
        );

        let seat1 = store.seat("m1", 1).unwrap();
        assert_eq!(seat1.status, SeatStatus::Held);
        assert_eq!(seat1.holder.as_deref(), Some("u1"));
        assert_eq!(seat1.expires_at_ms, Some(7_000));
        assert_eq!(store.seat("m1", 3).unwrap().status, SeatStatus::Available);

        // One overlapping seat rejects the whole request and changes nothing
        let outcome = store.apply_envelope(&envelope("c2", 1, 2_100, hold("u2", &[2, 3])));
        assert_eq!(outcome, Outcome::Rejected(Rejection::SeatUnavailable));
        assert_eq!(store.seat("m1", 3).unwrap().status, SeatStatus::Available);
        assert_eq!(store.occupied_seats("m1"), 2);
    }

    #[test]
    fn unknown_movie_and_unknown_seat_are_not_found() {
        let mut store = seeded_store();

        let outcome = store.apply_envelope(&envelope(
            "c1",
            1,
            2_000,
            Command::HoldSeats {
                user_id: "u1".into(),
                movie_id: "no-such-movie".into(),
                seats: vec![1],
                ttl_ms: 5_000,
            },
        ));
        assert_eq!(outcome, Outcome::Rejected(Rejection::NotFound));

        // Seat 9 was never seeded for a 3-seat screen
        let outcome = store.apply_envelope(&envelope("c1", 2, 2_100, hold("u1", &[1, 9])));
        assert_eq!(outcome, Outcome::Rejected(Rejection::NotFound));
        assert_eq!(store.occupied_seats("m1"), 0);
    }

    #[test]
    fn contended_seat_goes_to_exactly_one_client() {
        let mut store = seeded_store();

        let first = store.apply_envelope(&envelope("c1", 1, 2_000, hold("u1", &[3])));
        let second = store.apply_envelope(&envelope("c2", 1, 2_001, hold("u2", &[3])));

        assert!(matches!(first, Outcome::Held { .. }));
        assert_eq!(second, Outcome::Rejected(Rejection::SeatUnavailable));
        assert_eq!(store.occupied_seats("m1"), 1);
        assert_eq!(
            store.seat("m1", 3).unwrap().holder.as_deref(),
            Some("u1")
        );
    }

    #[test]
    fn replayed_request_returns_cached_outcome_without_side_effects() {
        let mut store = seeded_store();

        let first = store.apply_envelope(&envelope("c1", 7, 2_000, hold("u1", &[1])));
        let replay = store.apply_envelope(&envelope("c1", 7, 9_999, hold("u1", &[1])));

        assert_eq!(first, replay);
        assert_eq!(store.occupied_seats("m1"), 1);
        // No second booking was created
        assert!(store.booking("B2").is_none());
    }

    #[test]
    fn payment_confirms_pending_hold() {
        let mut store = seeded_store();
        store.apply_envelope(&envelope("c1", 1, 2_000, hold("u1", &[1])));

        let outcome = store.apply_envelope(&envelope(
            "c1",
            2,
            3_000,
            Command::ConfirmPayment {
                booking_id: "B1".into(),
                method: "card".into(),
            },
        ));
        assert_eq!(
            outcome,
            Outcome::Confirmed {
                confirmation: "PAY-B1-card".into()
            }
        );
        assert_eq!(store.seat("m1", 1).unwrap().status, SeatStatus::Booked);
        assert_eq!(store.booking("B1").unwrap().state, BookingState::Paid);

        // A second confirmation is no longer pending
        let outcome = store.apply_envelope(&envelope(
            "c1",
            3,
            3_500,
            Command::ConfirmPayment {
                booking_id: "B1".into(),
                method: "card".into(),
            },
        ));
        assert_eq!(outcome, Outcome::Rejected(Rejection::NotPending));
    }

    #[test]
    fn late_payment_is_rejected_and_releases_seats() {
        let mut store = seeded_store();
        store.apply_envelope(&envelope("c1", 1, 2_000, hold("u1", &[1])));

        // Hold expires at 7_000
        let outcome = store.apply_envelope(&envelope(
            "c1",
            2,
            8_000,
            Command::ConfirmPayment {
                booking_id: "B1".into(),
                method: "card".into(),
            },
        ));
        assert_eq!(outcome, Outcome::Rejected(Rejection::HoldExpired));
        assert_eq!(store.seat("m1", 1).unwrap().status, SeatStatus::Available);
        assert_eq!(store.booking("B1").unwrap().state, BookingState::Cancelled);
    }

    #[test]
    fn cancellation_rules() {
        let mut store = seeded_store();
        store.apply_envelope(&envelope("c1", 1, 2_000, hold("u1", &[1, 2])));

        // Wrong owner
        let outcome = store.apply_envelope(&envelope(
            "c2",
            1,
            2_500,
            Command::CancelBooking {
                booking_id: "B1".into(),
                user_id: "u2".into(),
            },
        ));
        assert_eq!(outcome, Outcome::Rejected(Rejection::NotOwner));

        // Owner cancels a pending booking
        let outcome = store.apply_envelope(&envelope(
            "c1",
            2,
            3_000,
            Command::CancelBooking {
                booking_id: "B1".into(),
                user_id: "u1".into(),
            },
        ));
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(store.seat("m1", 1).unwrap().status, SeatStatus::Available);
        assert_eq!(store.seat("m1", 2).unwrap().status, SeatStatus::Available);

        // Cancelling twice is rejected
        let outcome = store.apply_envelope(&envelope(
            "c1",
            3,
            3_500,
            Command::CancelBooking {
                booking_id: "B1".into(),
                user_id: "u1".into(),
            },
        ));
        assert_eq!(outcome, Outcome::Rejected(Rejection::NotCancellable));
    }

    #[test]
    fn paid_bookings_are_cancellable() {
        let mut store = seeded_store();
        store.apply_envelope(&envelope("c1", 1, 2_000, hold("u1", &[1])));
        store.apply_envelope(&envelope(
            "c1",
            2,
            3_000,
            Command::ConfirmPayment {
                booking_id: "B1".into(),
                method: "card".into(),
            },
        ));

        let outcome = store.apply_envelope(&envelope(
            "c1",
            3,
            4_000,
            Command::CancelBooking {
                booking_id: "B1".into(),
                user_id: "u1".into(),
            },
        ));
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(store.seat("m1", 1).unwrap().status, SeatStatus::Available);
    }

    #[test]
    fn expiry_sweep_releases_only_stale_holds() {
        let mut store = seeded_store();
        store.apply_envelope(&envelope("c1", 1, 2_000, hold("u1", &[1])));
        store.apply_envelope(&envelope("c2", 1, 6_000, hold("u2", &[2])));

        // At 8_000: B1 (deadline 7_000) is stale, B2 (deadline 11_000) is not
        let outcome =
            store.apply_envelope(&envelope("expirer", 1, 8_000, Command::ExpireHolds));
        assert_eq!(outcome, Outcome::HoldsExpired { bookings: 1 });

        assert_eq!(store.booking("B1").unwrap().state, BookingState::Cancelled);
        assert_eq!(store.seat("m1", 1).unwrap().status, SeatStatus::Available);
        assert_eq!(store.booking("B2").unwrap().state, BookingState::Pending);
        assert_eq!(store.seat("m1", 2).unwrap().status, SeatStatus::Held);
    }

    #[test]
    fn idempotency_cache_is_bounded_per_client() {
        let mut store = TicketStore::new(2);
        store.apply_envelope(&envelope(
            "seeder",
            1,
            1_000,
            Command::SeedMovies {
                movies: vec![Movie {
                    id: "m1".into(),
                    title: "A".into(),
                    total_seats: 10,
                    price: 10,
                }],
            },
        ));

        for seq in 1..=3 {
            store.apply_envelope(&envelope("c1", seq, 2_000, hold("u1", &[seq as u32])));
        }

        // Capacity 2: seq 1 was evicted, so its replay re-executes and is
        // rejected (the seat is still held by the original run)
        let replay = store.apply_envelope(&envelope("c1", 1, 2_500, hold("u1", &[1])));
        assert_eq!(replay, Outcome::Rejected(Rejection::SeatUnavailable));

        // Seq 3 is still cached and replays its original outcome
        let replay = store.apply_envelope(&envelope("c1", 3, 2_500, hold("u1", &[3])));
        assert_eq!(
            replay,
            Outcome::Held {
                booking_id: "B3".into(),
                total: 10
            }
        );
    }

    #[test]
    fn overbooking_is_impossible() {
        let mut store = seeded_store();
        for (client, seat) in [("c1", 1u32), ("c2", 2), ("c3", 3)] {
            store.apply_envelope(&envelope(client, 1, 2_000, hold(client, &[seat])));
        }

        // Catalog is full now; every further hold bounces
        let outcome = store.apply_envelope(&envelope("c4", 1, 2_100, hold("u4", &[1])));
        assert_eq!(outcome, Outcome::Rejected(Rejection::SeatUnavailable));

        let movie_capacity = 3;
        assert!(store.occupied_seats("m1") <= movie_capacity);
    }

    #[test]
    fn malformed_command_bytes_reject_cleanly() {
        let mut store = seeded_store();
        let output = StateMachine::apply(&mut store, b"not an envelope");
        assert_eq!(
            Outcome::decode(&output).unwrap(),
            Outcome::Rejected(Rejection::Malformed)
        );
    }
}
