//! A replicated box office on a 3-node in-process Raft cluster
//!
//! Every node applies the same booking commands in log order, so seat maps
//! and bookings agree on all replicas.
//!
//! Run with: cargo run --example booking_cluster

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use ticketbox_booking::{Command, Envelope, Movie, Outcome, TicketStore};
use ticketbox_consensus::{MemoryNetwork, MemoryStorage, NodeId, RaftConfig, RaftNode};

fn envelope(client_id: &str, request_seq: u64, applied_at_ms: u64, command: Command) -> Vec<u8> {
    Envelope {
        client_id: client_id.to_string(),
        request_seq,
        applied_at_ms,
        command,
    }
    .encode()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== TicketBox replicated box office ===\n");

    let node_ids = vec![NodeId(1), NodeId(2), NodeId(3)];
    let config = RaftConfig::default();
    let net = MemoryNetwork::new();

    let mut nodes = Vec::new();
    let mut stores = Vec::new();
    for &id in &node_ids {
        let store = Arc::new(RwLock::new(TicketStore::new(64)));
        let node = RaftNode::new(
            id,
            node_ids.clone(),
            config.clone(),
            Box::new(MemoryStorage::new()),
            Arc::clone(&store),
            net.transport(id),
        )
        .await?;
        net.register(id, node.clone());
        nodes.push(node);
        stores.push(store);
        println!("  started {id}");
    }

    let leader = loop {
        if let Some(leader) = nodes.iter().find(|n| n.is_leader()) {
            break leader.clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    println!(
        "\nLeader elected: {} at {}\n",
        leader.id(),
        leader.current_term()
    );

    // The box office opens: one screen, four seats
    let catalog = Command::SeedMovies {
        movies: vec![Movie {
            id: "m1".into(),
            title: "The Replicated Picture Show".into(),
            total_seats: 4,
            price: 12,
        }],
    };
    leader
        .propose(envelope("box-office", 1, 1_000, catalog), "box-office", 1)
        .await?;
    println!("Catalog seeded.\n");

    // alice holds two seats, then pays
    let hold = Command::HoldSeats {
        user_id: "alice".into(),
        movie_id: "m1".into(),
        seats: vec![1, 2],
        ttl_ms: 300_000,
    };
    let applied = leader
        .propose(envelope("alice-phone", 1, 2_000, hold), "alice-phone", 1)
        .await?;
    let booking_id = match Outcome::decode(&applied.response)? {
        Outcome::Held { booking_id, total } => {
            println!("alice holds seats 1-2 as {booking_id}, total {total}");
            booking_id
        }
        other => {
            println!("hold rejected: {other:?}");
            return Ok(());
        }
    };

    let pay = Command::ConfirmPayment {
        booking_id: booking_id.clone(),
        method: "card".into(),
    };
    let applied = leader
        .propose(envelope("alice-phone", 2, 3_000, pay), "alice-phone", 2)
        .await?;
    println!("payment: {:?}\n", Outcome::decode(&applied.response)?);

    // Give the followers a heartbeat to catch up, then compare replicas
    tokio::time::sleep(Duration::from_millis(200)).await;
    for (node, store) in nodes.iter().zip(&stores) {
        let store = store.read();
        println!(
            "{}: {}/4 seats occupied, {} is {:?}",
            node.id(),
            store.occupied_seats("m1"),
            booking_id,
            store.booking(&booking_id).map(|b| b.state)
        );
    }

    println!("\nShutting down cluster...");
    for node in &nodes {
        node.shutdown();
    }

    Ok(())
}
