//! Booking domain model

use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type MovieId = String;
pub type BookingId = String;
pub type SeatNo = u32;

/// A movie in the catalog, seeded at startup and immutable afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    pub id: MovieId,
    pub title: String,
    pub total_seats: u32,

    /// Price per seat in minor currency units
    pub price: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeatStatus {
    Available,
    Held,
    Booked,
}

/// One row per physical seat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub movie_id: MovieId,
    pub seat_no: SeatNo,
    pub status: SeatStatus,

    /// User holding or having booked the seat
    pub holder: Option<UserId>,

    /// Hold deadline; None once booked or released
    pub expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingState {
    Pending,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub movie_id: MovieId,
    pub seats: Vec<SeatNo>,
    pub total: u64,
    pub state: BookingState,
    pub created_at_ms: u64,

    /// Deadline by which payment must confirm the hold
    pub hold_expires_at_ms: u64,
}
