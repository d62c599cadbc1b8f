//! Client-facing RPC contract
//!
//! Requests and responses travel as 4-byte length-prefixed bincode frames,
//! the same wire discipline the Raft peers use. The user's identity always
//! comes from the token; `client_id`/`request_seq` only dedupe retries.

use serde::{Deserialize, Serialize};
use ticketbox_booking::{Booking, Movie};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Login {
        user: String,
        pass: String,
    },

    ListMovies {
        token: String,
    },

    BookSeats {
        token: String,
        movie_id: String,
        seats: Vec<u32>,
        client_id: String,
        request_seq: u64,
    },

    ConfirmPayment {
        token: String,
        booking_id: String,
        method: String,
        client_id: String,
        request_seq: u64,
    },

    ListMyBookings {
        token: String,
    },

    CancelBooking {
        token: String,
        booking_id: String,
        client_id: String,
        request_seq: u64,
    },

    Chat {
        token: String,
        prompt: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientResponse {
    LoggedIn {
        token: String,
        expires_at_ms: u64,
    },

    Movies {
        movies: Vec<Movie>,
    },

    Booked {
        booking_id: String,
        total: u64,

        /// Log index the write landed at; read-your-writes watermark
        applied_index: u64,
    },

    PaymentConfirmed {
        confirmation: String,
        applied_index: u64,
    },

    Bookings {
        bookings: Vec<Booking>,
    },

    Cancelled {
        applied_index: u64,
    },

    ChatReply {
        text: String,
    },

    Error {
        code: ErrorCode,
    },
}

/// Structured error codes observable by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,

    /// This node is a follower; retry against the hinted client address
    NotLeader { hint: Option<String> },

    LeadershipLost,
    Timeout,
    SeatUnavailable,
    NotFound,
    NotPending,
    NotOwner,
    NotCancellable,
    Expired,
    ShuttingDown,
    Internal,
}

impl ClientResponse {
    pub fn error(code: ErrorCode) -> Self {
        ClientResponse::Error { code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let request = ClientRequest::BookSeats {
            token: "t".into(),
            movie_id: "m1".into(),
            seats: vec![1, 2],
            client_id: "c1".into(),
            request_seq: 1,
        };
        let bytes = bincode::serialize(&request).unwrap();
        let decoded: ClientRequest = bincode::deserialize(&bytes).unwrap();
        match decoded {
            ClientRequest::BookSeats { seats, .. } => assert_eq!(seats, vec![1, 2]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn error_response_roundtrip() {
        let response = ClientResponse::error(ErrorCode::NotLeader {
            hint: Some("127.0.0.1:7002".into()),
        });
        let bytes = bincode::serialize(&response).unwrap();
        assert_eq!(
            bincode::deserialize::<ClientResponse>(&bytes).unwrap(),
            response
        );
    }
}
