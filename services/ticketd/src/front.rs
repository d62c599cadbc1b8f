//! ServiceFront: the external face of a node
//!
//! Writes are serialized into envelopes, stamped with the proposer's clock
//! and routed through Raft; reads come straight off the local state
//! machine. Followers answer writes with a leader hint instead of proxying.

use crate::api::{ClientRequest, ClientResponse, ErrorCode};
use crate::assistant::Assistant;
use crate::auth::{Authenticator, Principal};
use crate::config::NodeConfig;
use crate::now_ms;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use ticketbox_booking::{Command, Envelope, Outcome, Rejection, TicketStore};
use ticketbox_consensus::{NodeId, RaftError, RaftNode};
use tracing::warn;

pub struct ServiceFront {
    node: RaftNode,
    store: Arc<RwLock<TicketStore>>,
    auth: Arc<dyn Authenticator>,
    assistant: Arc<dyn Assistant>,
    client_addrs: HashMap<NodeId, String>,
    propose_timeout: Duration,
    seat_hold_ttl_ms: u64,
}

impl ServiceFront {
    pub fn new(
        node: RaftNode,
        store: Arc<RwLock<TicketStore>>,
        auth: Arc<dyn Authenticator>,
        assistant: Arc<dyn Assistant>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            node,
            store,
            auth,
            assistant,
            client_addrs: config.client_addrs(),
            propose_timeout: config.propose_timeout(),
            seat_hold_ttl_ms: config.seat_hold_ttl_ms,
        }
    }

    pub async fn handle(&self, request: ClientRequest) -> ClientResponse {
        match request {
            ClientRequest::Login { user, pass } => match self.auth.authenticate(&user, &pass) {
                Some(session) => ClientResponse::LoggedIn {
                    token: session.token,
                    expires_at_ms: session.expires_at_ms,
                },
                None => ClientResponse::error(ErrorCode::Unauthorized),
            },

            ClientRequest::ListMovies { token } => match self.principal(&token) {
                Some(_) => ClientResponse::Movies {
                    movies: self.store.read().movies(),
                },
                None => ClientResponse::error(ErrorCode::Unauthorized),
            },

            ClientRequest::BookSeats {
                token,
                movie_id,
                seats,
                client_id,
                request_seq,
            } => {
                let principal = match self.principal(&token) {
                    Some(principal) => principal,
                    None => return ClientResponse::error(ErrorCode::Unauthorized),
                };
                let command = Command::HoldSeats {
                    user_id: principal.user,
                    movie_id,
                    seats,
                    ttl_ms: self.seat_hold_ttl_ms,
                };
                match self.propose(client_id, request_seq, command).await {
                    Ok((Outcome::Held { booking_id, total }, applied_index)) => {
                        ClientResponse::Booked {
                            booking_id,
                            total,
                            applied_index,
                        }
                    }
                    Ok((outcome, _)) => ClientResponse::error(outcome_error_code(outcome)),
                    Err(code) => ClientResponse::error(code),
                }
            }

            ClientRequest::ConfirmPayment {
                token,
                booking_id,
                method,
                client_id,
                request_seq,
            } => {
                if self.principal(&token).is_none() {
                    return ClientResponse::error(ErrorCode::Unauthorized);
                }
                let command = Command::ConfirmPayment { booking_id, method };
                match self.propose(client_id, request_seq, command).await {
                    Ok((Outcome::Confirmed { confirmation }, applied_index)) => {
                        ClientResponse::PaymentConfirmed {
                            confirmation,
                            applied_index,
                        }
                    }
                    Ok((outcome, _)) => ClientResponse::error(outcome_error_code(outcome)),
                    Err(code) => ClientResponse::error(code),
                }
            }

            ClientRequest::ListMyBookings { token } => match self.principal(&token) {
                Some(principal) => ClientResponse::Bookings {
                    bookings: self.store.read().bookings_for(&principal.user),
                },
                None => ClientResponse::error(ErrorCode::Unauthorized),
            },

            ClientRequest::CancelBooking {
                token,
                booking_id,
                client_id,
                request_seq,
            } => {
                let principal = match self.principal(&token) {
                    Some(principal) => principal,
                    None => return ClientResponse::error(ErrorCode::Unauthorized),
                };
                let command = Command::CancelBooking {
                    booking_id,
                    user_id: principal.user,
                };
                match self.propose(client_id, request_seq, command).await {
                    Ok((Outcome::Cancelled, applied_index)) => {
                        ClientResponse::Cancelled { applied_index }
                    }
                    Ok((outcome, _)) => ClientResponse::error(outcome_error_code(outcome)),
                    Err(code) => ClientResponse::error(code),
                }
            }

            ClientRequest::Chat { token, prompt } => match self.principal(&token) {
                Some(principal) => ClientResponse::ChatReply {
                    text: self.assistant.chat(&principal.user, &prompt).await,
                },
                None => ClientResponse::error(ErrorCode::Unauthorized),
            },
        }
    }

    fn principal(&self, token: &str) -> Option<Principal> {
        self.auth.validate(token)
    }

    /// Propose a command and wait for it to be applied
    async fn propose(
        &self,
        client_id: String,
        request_seq: u64,
        command: Command,
    ) -> Result<(Outcome, u64), ErrorCode> {
        let envelope = Envelope {
            client_id: client_id.clone(),
            request_seq,
            applied_at_ms: now_ms(),
            command,
        };

        let proposal = self
            .node
            .propose(envelope.encode(), client_id, request_seq);

        match tokio::time::timeout(self.propose_timeout, proposal).await {
            Err(_) => Err(ErrorCode::Timeout),
            Ok(Err(RaftError::NotLeader(leader))) => Err(ErrorCode::NotLeader {
                hint: leader.and_then(|id| self.client_addrs.get(&id).cloned()),
            }),
            Ok(Err(RaftError::LeadershipLost)) => Err(ErrorCode::LeadershipLost),
            Ok(Err(RaftError::ShuttingDown)) => Err(ErrorCode::ShuttingDown),
            Ok(Err(e)) => {
                warn!(error = %e, "proposal failed");
                Err(ErrorCode::Internal)
            }
            Ok(Ok(applied)) => match Outcome::decode(&applied.response) {
                Ok(outcome) => Ok((outcome, applied.index.0)),
                Err(e) => {
                    warn!(error = %e, "state machine returned undecodable outcome");
                    Err(ErrorCode::Internal)
                }
            },
        }
    }
}

/// Map a rejection (or an outcome that does not match the request kind)
/// to its wire code
fn outcome_error_code(outcome: Outcome) -> ErrorCode {
    match outcome {
        Outcome::Rejected(rejection) => match rejection {
            Rejection::SeatUnavailable => ErrorCode::SeatUnavailable,
            Rejection::NotPending => ErrorCode::NotPending,
            Rejection::HoldExpired => ErrorCode::Expired,
            Rejection::NotOwner => ErrorCode::NotOwner,
            Rejection::NotCancellable => ErrorCode::NotCancellable,
            Rejection::NotFound => ErrorCode::NotFound,
            Rejection::Malformed => ErrorCode::Internal,
        },
        other => {
            warn!(?other, "outcome does not match the request kind");
            ErrorCode::Internal
        }
    }
}
