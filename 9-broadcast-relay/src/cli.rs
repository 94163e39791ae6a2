use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::server::{ServerConfig, ShutdownPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP clients and fanning their lines out.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8001")]
    pub listen: SocketAddr,

    /// Lines queued per client before it is treated as unreachable.
    #[arg(long, default_value_t = 1024)]
    pub outbound_capacity: usize,

    /// What to do with connected clients on shutdown.
    #[arg(long, value_enum, default_value_t = ShutdownPolicy::Close)]
    pub shutdown: ShutdownPolicy,

    /// Consecutive unrecognised accept failures tolerated before the listener
    /// is abandoned. Running out of descriptors or memory never counts.
    #[arg(long, default_value_t = 64)]
    pub max_accept_failures: u32,

    /// Milliseconds to pause after an accept failure before trying again.
    #[arg(long, default_value_t = 100)]
    pub accept_backoff_ms: u64,

    /// Seconds to wait for clients to tear down when closing them on shutdown.
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl From<&ServeArgs> for ServerConfig {
    fn from(args: &ServeArgs) -> Self {
        ServerConfig {
            outbound_capacity: args.outbound_capacity,
            shutdown: args.shutdown,
            max_accept_failures: args.max_accept_failures.max(1),
            accept_backoff: Duration::from_millis(args.accept_backoff_ms),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name announced to the other participants.
    #[arg(long)]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8001")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_server_config() {
        let cli = Cli::parse_from(["relay", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        let config = ServerConfig::from(&args);

        assert_eq!(args.listen, "127.0.0.1:8001".parse::<SocketAddr>().unwrap());
        assert_eq!(config.outbound_capacity, 1024);
        assert_eq!(config.shutdown, ShutdownPolicy::Close);
        assert_eq!(config.max_accept_failures, 64);
        assert_eq!(config.accept_backoff, ServerConfig::default().accept_backoff);
    }

    #[test]
    fn drain_policy_parses() {
        let cli = Cli::parse_from([
            "relay",
            "serve",
            "--shutdown",
            "drain",
            "--listen",
            "0.0.0.0:9000",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.shutdown, ShutdownPolicy::Drain);
        assert_eq!(args.listen.port(), 9000);
    }

    #[test]
    fn client_requires_a_name() {
        assert!(Cli::try_parse_from(["relay", "client"]).is_err());
        let cli = Cli::parse_from(["relay", "client", "--name", "alice"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.name, "alice");
    }
}
