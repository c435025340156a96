//! Command line interface
//!
//! `profiled` with no subcommand runs the daemon; the other subcommands are
//! thin clients talking to a running daemon over its socket.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;

use crate::config::ServicePaths;
use crate::daemon::run_profile_daemon;
use crate::ipc::ProfileClient;

#[derive(Parser, Debug)]
#[command(name = "profiled", version, about = "Profile settings daemon")]
pub struct Cli {
    /// Service root holding the socket, configuration and values
    #[arg(long, env = "PROFILED_ROOT", global = true)]
    pub root: Option<PathBuf>,

    /// Socket path (defaults to <root>/tmp/profiled.socket)
    #[arg(long, env = "PROFILED_SOCKET", global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon (default)
    Serve,
    /// List known profiles
    Profiles,
    /// Exit with status 1 unless the profile exists
    Has { profile: String },
    /// List known keys
    Keys,
    /// Print the active profile
    Current,
    /// Activate a profile
    Use { profile: String },
    /// Print the effective value of a key
    Get {
        key: String,
        /// Profile to read (defaults to the active profile)
        #[arg(long, short, default_value = "")]
        profile: String,
    },
    /// Set a value
    Set {
        key: String,
        value: String,
        /// Profile to change (defaults to the active profile)
        #[arg(long, short, default_value = "")]
        profile: String,
    },
    /// Print every profile with all keys, values and datatypes
    Dump,
}

impl Cli {
    pub fn paths(&self) -> ServicePaths {
        let root = self.root.clone().unwrap_or_else(ServicePaths::default_root);
        let paths = ServicePaths::from_root(root);
        match &self.socket {
            Some(socket) => paths.with_socket(socket),
            None => paths,
        }
    }

    pub fn run(self) -> Result<()> {
        let paths = self.paths();
        match self.command.unwrap_or(Command::Serve) {
            Command::Serve => run_profile_daemon(paths),
            command => {
                let mut client = ProfileClient::connect_to(&paths.socket)?;
                run_client(&mut client, command)
            }
        }
    }
}

fn run_client(client: &mut ProfileClient, command: Command) -> Result<()> {
    match command {
        Command::Serve => bail!("serve is not a client command"),
        Command::Profiles => {
            for profile in client.get_profiles()? {
                println!("{profile}");
            }
        }
        Command::Has { profile } => {
            let known = client.has_profile(&profile)?;
            println!("{known}");
            if !known {
                std::process::exit(1);
            }
        }
        Command::Keys => {
            for key in client.get_keys()? {
                println!("{key}\t{}", client.get_datatype(&key)?);
            }
        }
        Command::Current => println!("{}", client.get_profile()?),
        Command::Use { profile } => {
            let active = client.set_profile(&profile)?;
            if active != profile {
                warn!(requested = %profile, active = %active, "Unknown profile, active profile unchanged");
            }
            println!("{active}");
        }
        Command::Get { key, profile } => println!("{}", client.get_value(&profile, &key)?),
        Command::Set {
            key,
            value,
            profile,
        } => println!("{}", client.set_value(&profile, &key, &value)?),
        Command::Dump => {
            let active = client.get_profile()?;
            for profile in client.get_profiles()? {
                let marker = if profile == active { " (active)" } else { "" };
                println!("PROFILE: {profile}{marker}");
                for (key, value, datatype) in client.get_values(&profile)? {
                    println!("\t{key:<32} = {value:>12} ({datatype})");
                }
            }
        }
    }
    Ok(())
}
