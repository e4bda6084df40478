//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use shopscope::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Search { query, .. } => println!("searching for {query}"),
//!     _ => {}
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Auto)]
pub struct Cli {
    /// Configuration file. Defaults to `<config_dir>/config.yaml`.
    #[arg(long, short = 'c', global = true, env = "SHOPSCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API.
    Serve {
        /// Listen address; overrides `http_bind` from the config.
        #[arg(long, short = 'b')]
        bind: Option<String>,
    },

    /// Embed the source table into the vector index.
    #[clap(alias = "v")]
    Vectorize {
        /// CSV source; overrides `storage.source_path`.
        #[arg(long, short = 's')]
        source: Option<PathBuf>,

        /// Index file to write; overrides `storage.vector_index_path`.
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Find the categories most similar to a query.
    Search {
        query: String,

        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: i64,

        #[arg(long, short = 'm', default_value_t = 0.0, allow_negative_numbers = true)]
        min_similarity: f64,
    },

    /// Ask one question, optionally continuing a session.
    #[clap(alias = "a")]
    Ask {
        message: String,

        /// Session id to continue.
        #[arg(long, short = 's')]
        session: Option<String>,

        /// System prompt for this turn, replacing the template's.
        #[arg(long)]
        system: Option<String>,

        /// Template name under `<config_dir>/templates/`; overrides `template` from the config.
        #[arg(long, short = 't')]
        template: Option<String>,

        /// Do not store the turn.
        #[arg(long)]
        no_save: bool,
    },

    /// Manage stored chat sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Write a default config file and template.
    Init {
        /// Overwrite existing files.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionAction {
    /// List sessions, most recent first.
    List,
    /// Print one session with its messages.
    Show { id: String },
    /// Create an empty session.
    Create { title: Option<String> },
    Rename { id: String, title: String },
    Delete { id: String },
    /// Remove all messages, keeping the session.
    Clear { id: String },
    /// Rebuild the session index from the session files.
    Repair,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_search_with_options() {
        let cli = Cli::parse_from([
            "shopscope", "search", "gaming laptop", "--top-k", "3", "--min-similarity", "0.5",
        ]);
        match cli.command {
            Commands::Search {
                query,
                top_k,
                min_similarity,
            } => {
                assert_eq!(query, "gaming laptop");
                assert_eq!(top_k, 3);
                assert_eq!(min_similarity, 0.5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parses_sessions_subcommands_and_global_config() {
        let cli = Cli::parse_from(["shopscope", "sessions", "rename", "abc", "New title", "-c", "x.yaml"]);
        assert_eq!(cli.config, Some(PathBuf::from("x.yaml")));
        assert!(matches!(
            cli.command,
            Commands::Sessions {
                action: SessionAction::Rename { .. }
            }
        ));
    }

    #[test]
    fn test_parses_ask_flags() {
        let cli = Cli::parse_from(["shopscope", "ask", "hi", "--no-save", "-s", "sess-1"]);
        match cli.command {
            Commands::Ask {
                message,
                session,
                no_save,
                ..
            } => {
                assert_eq!(message, "hi");
                assert_eq!(session.as_deref(), Some("sess-1"));
                assert!(no_save);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
