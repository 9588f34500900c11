//! CLI client for broker control operations.
//!
//! One-shot commands: connect to the control socket, perform a single
//! request, print the result, and exit.

mod broker_client;
mod format;

use std::path::PathBuf;

use crate::cli::ClientAction;
use broker_client::BrokerClient;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("broker: {0}")]
    Broker(String),
}

/// Run the client command. Called from `main.rs` for `Command::Client`.
pub async fn run(socket: Option<PathBuf>, action: ClientAction) -> Result<(), ClientError> {
    let socket_path = match socket {
        Some(path) => path,
        None => broker_client::resolve_socket_path()?,
    };
    let mut broker = BrokerClient::connect(&socket_path).await?;

    match action {
        ClientAction::Connections { user } => {
            let connections = broker.list_connections(user).await?;
            format::print_connections(&connections);
        }
        ClientAction::Relay { user } => {
            let outcome = broker.relay_now(&user).await?;
            format::print_relay(&user, &outcome);
        }
        ClientAction::Logout { user } => {
            let counts = broker.logout_user(&user).await?;
            format::print_logout(&user, counts);
        }
        ClientAction::StoreSession {
            user,
            username,
            token,
        } => {
            validate_store_args(&user, &username, &token)?;
            broker
                .store_session(&user, &username, token.into_bytes())
                .await?;
            format::print_stored(&user);
        }
    }

    Ok(())
}

/// Reject empty values before they reach the broker.
fn validate_store_args(user: &str, username: &str, token: &str) -> Result<(), ClientError> {
    for (flag, value) in [("--user", user), ("--username", username), ("--token", token)] {
        if value.is_empty() {
            return Err(ClientError::Broker(format!("{flag} must not be empty")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_args_ok() {
        assert!(validate_store_args("u1", "alice", "tok").is_ok());
    }

    #[test]
    fn store_args_empty_token() {
        let err = validate_store_args("u1", "alice", "").unwrap_err();
        assert!(err.to_string().contains("--token"));
    }
}
