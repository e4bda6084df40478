//! # Shopscope (library root)
//!
//! Conversational retrieval over a product-category catalogue:
//! - **Retrieval**: categories from a CSV export are embedded by an OpenAI compatible provider
//!   ([`embedding`], [`vectorizer`]) into a persisted cosine-similarity index ([`vector_store`]),
//!   queried through [`retrieval`].
//! - **Chat**: durable sessions on disk ([`session_store`]), a bounded context window
//!   ([`context`]), and one completion call per turn ([`completion`]) coordinated by
//!   [`gateway`].
//! - **Surfaces**: an axum HTTP API ([`server`]) and a clap CLI ([`commands`]), both configured
//!   from one YAML file ([`config`], [`template`]).
//!
//! Every service is constructed explicitly and passed where it is needed; there is no global
//! store. All fallible operations return [`error::Result`].
//!
//! ## Modules
//! - [`error`], [`models`], [`persist`]
//! - [`vector_store`], [`embedding`], [`source`], [`vectorizer`], [`retrieval`]
//! - [`session_store`], [`context`], [`completion`], [`gateway`]
//! - [`config`], [`template`], [`server`], [`commands`]

use directories::ProjectDirs;
use std::path::PathBuf;

pub mod commands;
pub mod completion;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod gateway;
pub mod models;
pub mod persist;
pub mod provider;
pub mod retrieval;
pub mod server;
pub mod session_store;
pub mod source;
pub mod template;
pub mod vector_store;
pub mod vectorizer;

/// Return the per-platform configuration directory used by Shopscope.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "shopscope", "shopscope")`, so you get the right place on each OS
/// (e.g., `~/.config/shopscope` on Linux).
///
/// The directory is **not** created by this function.
///
/// # Errors
/// Returns [`error::Error::PersistenceFailure`] if the platform configuration directory cannot
/// be determined (rare, but possible in heavily sandboxed environments).
///
/// # Examples
/// ```rust
/// let cfg = shopscope::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> error::Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "shopscope", "shopscope").ok_or_else(|| {
        error::Error::PersistenceFailure {
            message: "unable to determine config directory".to_string(),
            unsaved_reply: None,
        }
    })?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
