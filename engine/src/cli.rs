//! CLI interface for Provisio
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for managing provider packages
//! and running providers.

use clap::{Parser, Subcommand};
use sdk::protocol::Verb;
use std::path::PathBuf;

/// Provisio hardware provider engine
///
/// Imports signed, encrypted provider packages and runs their probe, plan
/// and apply verbs inside a sandbox.
#[derive(Parser, Debug)]
#[command(name = "provisio")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import a provider package
    Import {
        /// Path to the .cbp package
        package: PathBuf,
    },

    /// List installed providers
    List,

    /// Show details of an installed provider
    Show {
        /// Provider id
        id: String,
    },

    /// Remove an installed provider
    Remove {
        /// Provider id
        id: String,
    },

    /// Run a single provider verb
    Exec {
        /// Provider id
        id: String,

        /// probe, plan or apply
        verb: Verb,

        /// JSON file with the configuration to send
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
    },

    /// Converge a provider to a desired state (plan, probe, apply, verify)
    Run {
        /// Provider id
        id: String,

        /// JSON file with the desired configuration
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Job id used when streaming logs
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Build a signed, encrypted provider package
    Pack {
        /// Manifest JSON
        #[arg(long, value_name = "FILE")]
        manifest: PathBuf,

        /// Watermark JSON
        #[arg(long, value_name = "FILE")]
        watermark: PathBuf,

        /// Plaintext provider executable
        #[arg(long, value_name = "FILE")]
        binary: PathBuf,

        /// Publisher signing key (SEC1 PEM)
        #[arg(long, value_name = "FILE")]
        signing_key: PathBuf,

        /// Optional configuration schema JSON
        #[arg(long, value_name = "FILE")]
        schema: Option<PathBuf>,

        /// Output package path
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Unpack every entry of a package into a directory
    Extract {
        /// Path to the .cbp package
        package: PathBuf,

        /// Destination directory
        dest: PathBuf,
    },

    /// Generate a master key and a publisher key pair
    Keygen {
        /// Directory to write the keys into
        dir: PathBuf,

        /// Overwrite existing key files
        #[arg(long)]
        force: bool,
    },

    /// Show recorded watermark violations
    Violations {
        /// Only violations that have not been resolved
        #[arg(long)]
        active: bool,
    },

    /// Print the default configuration declared by a package schema
    SchemaDefaults {
        /// Path to the .cbp package
        package: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["provisio", "--json", "--log", "debug", "list"]);
        assert!(cli.json);
        assert_eq!(cli.log.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::List));
    }

    #[test]
    fn test_exec_command() {
        let cli = Cli::parse_from(["provisio", "exec", "raid", "plan", "--input", "cfg.json"]);
        if let Command::Exec { id, verb, input } = cli.command {
            assert_eq!(id, "raid");
            assert_eq!(verb, Verb::Plan);
            assert_eq!(input, Some(PathBuf::from("cfg.json")));
        } else {
            panic!("Expected Exec command");
        }
    }

    #[test]
    fn test_exec_rejects_unknown_verb() {
        assert!(Cli::try_parse_from(["provisio", "exec", "raid", "destroy"]).is_err());
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from([
            "provisio", "run", "raid", "--input", "desired.json", "--job-id", "job-7",
        ]);
        if let Command::Run { id, input, job_id } = cli.command {
            assert_eq!(id, "raid");
            assert_eq!(input, PathBuf::from("desired.json"));
            assert_eq!(job_id.as_deref(), Some("job-7"));
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_violations_active() {
        let cli = Cli::parse_from(["provisio", "violations", "--active"]);
        assert!(matches!(cli.command, Command::Violations { active: true }));
    }

    #[test]
    fn test_pack_requires_output() {
        assert!(Cli::try_parse_from([
            "provisio",
            "pack",
            "--manifest",
            "m.json",
            "--watermark",
            "w.json",
            "--binary",
            "provider",
            "--signing-key",
            "key.pem",
        ])
        .is_err());
    }
}
