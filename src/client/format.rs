//! Output formatting for CLI client commands.

use crate::ipc::protocol::ConnectionDescriptor;

use super::broker_client::LogoutCounts;

/// Print connection descriptors as a table to stdout.
pub fn print_connections(connections: &[ConnectionDescriptor]) {
    if connections.is_empty() {
        println!("No bound connections");
        return;
    }

    println!(
        "{:<10} {:<20} {:<20} {:<16} {:<24} FLAGS",
        "CONN", "NODE", "CLIENT", "USER", "HIERARCHY"
    );
    println!("{}", "-".repeat(100));
    for c in connections {
        println!(
            "{:<10} {:<20} {:<20} {:<16} {:<24} {}",
            c.connection_id,
            c.node_id,
            c.client_id,
            c.user_id.as_deref().unwrap_or("-"),
            format_hierarchy(c),
            if c.closed_by_logout { "closing" } else { "-" },
        );
    }
}

pub fn print_relay(user_id: &str, outcome: &str) {
    println!("Relay for {user_id}: {outcome}");
}

pub fn print_logout(user_id: &str, counts: LogoutCounts) {
    println!(
        "Logged out {user_id}: {} acknowledged, {} missing",
        counts.delivered, counts.missing
    );
}

pub fn print_stored(user_id: &str) {
    println!("Stored session for {user_id}");
}

/// `domain/cluster/channel`, `-` for missing parts, or `-` when none set.
fn format_hierarchy(c: &ConnectionDescriptor) -> String {
    let parts = [&c.domain_id, &c.cluster_id, &c.channel_id];
    if parts.iter().all(|p| p.is_none()) {
        return "-".to_string();
    }
    parts
        .iter()
        .map(|p| p.as_deref().unwrap_or("-"))
        .collect::<Vec<_>>()
        .join("/")
}
