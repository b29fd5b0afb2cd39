use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::registry::{DEFAULT_OUTBOUND_CAPACITY, RegistryConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat hub, accepting TCP connections.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_HUB_LISTEN", default_value = "127.0.0.1:7070")]
    pub listen: SocketAddr,

    /// Messages buffered per client before broadcasts to it are dropped.
    #[arg(long, env = "CHAT_HUB_OUTBOUND_CAPACITY", default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// Delete a room as soon as its last member leaves.
    #[arg(long, env = "CHAT_HUB_REMOVE_EMPTY_ROOMS")]
    pub remove_empty_rooms: bool,

    /// Refuse joins for rooms that do not exist yet.
    #[arg(long, env = "CHAT_HUB_NO_CREATE_ROOMS_ON_JOIN")]
    pub no_create_rooms_on_join: bool,
}

impl ServeArgs {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            create_rooms_on_join: !self.no_create_rooms_on_join,
            remove_empty_rooms: self.remove_empty_rooms,
            outbound_capacity: self.outbound_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn serve(args: &[&str]) -> ServeArgs {
        let cli = Cli::try_parse_from(["chat-hub", "serve"].iter().chain(args)).unwrap();
        match cli.command {
            Command::Serve(args) => args,
        }
    }

    #[test]
    fn defaults_match_the_registry_defaults() {
        let config = serve(&["--listen", "127.0.0.1:0"]).registry_config();
        let defaults = RegistryConfig::default();

        assert_eq!(config.create_rooms_on_join, defaults.create_rooms_on_join);
        assert_eq!(config.remove_empty_rooms, defaults.remove_empty_rooms);
        assert_eq!(config.outbound_capacity, defaults.outbound_capacity);
    }

    #[test]
    fn room_policies_can_be_flipped() {
        let config = serve(&[
            "--listen",
            "127.0.0.1:0",
            "--remove-empty-rooms",
            "--no-create-rooms-on-join",
            "--outbound-capacity",
            "8",
        ])
        .registry_config();

        assert!(!config.create_rooms_on_join);
        assert!(config.remove_empty_rooms);
        assert_eq!(config.outbound_capacity, 8);
    }

    #[test]
    fn every_serve_option_has_an_env_fallback() {
        let command = Cli::command();
        let serve = command.find_subcommand("serve").unwrap();
        let env_of = |id: &str| {
            serve
                .get_arguments()
                .find(|arg| arg.get_id() == id)
                .and_then(|arg| arg.get_env())
                .and_then(|env| env.to_str())
                .map(str::to_owned)
        };

        assert_eq!(env_of("listen").as_deref(), Some("CHAT_HUB_LISTEN"));
        assert_eq!(
            env_of("outbound_capacity").as_deref(),
            Some("CHAT_HUB_OUTBOUND_CAPACITY")
        );
        assert_eq!(
            env_of("remove_empty_rooms").as_deref(),
            Some("CHAT_HUB_REMOVE_EMPTY_ROOMS")
        );
        assert_eq!(
            env_of("no_create_rooms_on_join").as_deref(),
            Some("CHAT_HUB_NO_CREATE_ROOMS_ON_JOIN")
        );
    }
}
