//! Main module for the Shopscope CLI application.
//!
//! Parses the command line, loads the configuration, installs logging once, and dispatches to
//! the library: the HTTP server, the vectorizer, search, one-shot chat, or session management.
//!
//! # Examples
//!
//! ```sh
//! shopscope init
//! shopscope vectorize --source categories.csv
//! shopscope search "gaming laptop" --top-k 3
//! shopscope ask "Which category fits a 15 inch laptop bag?"
//! shopscope serve --bind 0.0.0.0:8000
//! ```

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::OnceCell;
use std::{error::Error, fs, path::Path, time::Duration};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use shopscope::{
    commands::{Cli, Commands, SessionAction},
    config::{ShopscopeConfig, load_config},
    config_dir,
    error,
    server::{self, AppState},
    session_store::SessionStore,
    template::{ChatTemplate, load_template},
};

static TRACING: OnceCell<()> = OnceCell::new();

const DEFAULT_TEMPLATE_NAME: &str = "shopping";

/// Install the fmt subscriber once. `RUST_LOG` wins over the configured level.
fn init_tracing(default_level: &str) {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}

/// Load configuration and execute the parsed command.
async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if let Commands::Init { force } = cli.command {
        init_tracing("info");
        return init(force);
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => config_dir()?.join("config.yaml"),
    };
    let config = load_config(&config_path)?;
    init_tracing(&config.log_level);
    debug!("Config loaded from {}", config_path.display());

    match cli.command {
        Commands::Serve { bind } => {
            let template = resolve_template(&config, None).await?;
            let state = AppState::from_config(&config, template).await?;
            let bind = bind.unwrap_or_else(|| config.http_bind.clone());
            server::serve(state, &bind).await?;
        }
        Commands::Vectorize { source, output } => {
            let retrieval = server::build_retrieval(&config)?;
            let spinner = ProgressBar::new_spinner().with_style(
                ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.set_message("Vectorizing categories");
            spinner.enable_steady_tick(Duration::from_millis(120));
            let result = retrieval
                .vectorize(source.as_deref(), output.as_deref())
                .await;
            spinner.finish_and_clear();

            let report = result?;
            println!("{}", report.message);
            println!(
                "{} records written to {} ({} reused, {} failed)",
                report.total, report.output_path, report.reused, report.failed
            );
            for item in &report.errors {
                println!(
                    "  ! {}: {}",
                    item.id.as_deref().unwrap_or("<no id>"),
                    item.message
                );
            }
        }
        Commands::Search {
            query,
            top_k,
            min_similarity,
        } => {
            let retrieval = server::build_retrieval(&config)?;
            let results = retrieval.search(&query, top_k, min_similarity).await?;
            if results.is_empty() {
                println!("No matches.");
            }
            for result in results {
                println!(
                    "{:.4}  {}  {}  {}",
                    result.similarity, result.id, result.name, result.source_url
                );
            }
        }
        Commands::Ask {
            message,
            session,
            system,
            template,
            no_save,
        } => {
            let template = resolve_template(&config, template.as_deref()).await?;
            let gateway = server::build_gateway(&config, template).await?;
            match gateway
                .send_simple(&message, system.as_deref(), session.as_deref(), !no_save)
                .await
            {
                Ok(reply) => {
                    println!("{}", reply.reply);
                    if let Some(id) = reply.session_id {
                        eprintln!("session: {id}");
                    }
                }
                Err(error::Error::PersistenceFailure {
                    message,
                    unsaved_reply: Some(reply),
                }) => {
                    println!("{reply}");
                    return Err(format!("turn was not saved: {message}").into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Sessions { action } => {
            let store = SessionStore::open(&config.storage.chat_history_dir).await?;
            sessions(&store, action).await?;
        }
        Commands::Init { .. } => {}
    }

    Ok(())
}

async fn sessions(store: &SessionStore, action: SessionAction) -> Result<(), Box<dyn Error>> {
    match action {
        SessionAction::List => {
            for s in store.list_sessions().await? {
                println!(
                    "{}  {:>4} msgs  {}  {}",
                    s.id,
                    s.message_count,
                    s.updated_at.format("%Y-%m-%d %H:%M"),
                    s.title
                );
            }
        }
        SessionAction::Show { id } => {
            let session = store.get_session(&id).await?;
            println!("{} ({} messages)", session.title, session.message_count());
            for m in &session.messages {
                println!("[{}] {}: {}", m.timestamp.format("%H:%M:%S"), m.role, m.content);
            }
        }
        SessionAction::Create { title } => {
            let session = store.create_session(title.as_deref()).await?;
            println!("{}", session.id);
        }
        SessionAction::Rename { id, title } => {
            let summary = store.rename_session(&id, &title).await?;
            println!("Renamed {} to {}", summary.id, summary.title);
        }
        SessionAction::Delete { id } => {
            store.delete_session(&id).await?;
            println!("Deleted {id}");
        }
        SessionAction::Clear { id } => {
            store.clear_messages(&id).await?;
            println!("Cleared {id}");
        }
        SessionAction::Repair => {
            let report = store.repair().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

/// The named template (CLI flag, then config), or the built-in default.
async fn resolve_template(
    config: &ShopscopeConfig,
    name: Option<&str>,
) -> Result<ChatTemplate, Box<dyn Error>> {
    match name.or(config.template.as_deref()) {
        Some(name) => Ok(load_template(&config_dir()?.join("templates"), name).await?),
        None => Ok(ChatTemplate::default()),
    }
}

/// Write a default config file and template under the configuration directory.
fn init(force: bool) -> Result<(), Box<dyn Error>> {
    let config_dir = config_dir()?;
    let templates_dir = config_dir.join("templates");
    info!("Creating template directory: {}", templates_dir.display());
    fs::create_dir_all(&templates_dir)?;

    let template_path = templates_dir.join(format!("{DEFAULT_TEMPLATE_NAME}.yaml"));
    write_unless_present(&template_path, &serde_yaml::to_string(&ChatTemplate::default())?, force)?;

    let config = ShopscopeConfig {
        template: Some(DEFAULT_TEMPLATE_NAME.to_string()),
        ..Default::default()
    };
    let config_path = config_dir.join("config.yaml");
    write_unless_present(&config_path, &serde_yaml::to_string(&config)?, force)?;
    Ok(())
}

fn write_unless_present(path: &Path, content: &str, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        println!("Keeping existing {}", path.display());
        return Ok(());
    }
    info!("Writing {}", path.display());
    fs::write(path, content)?;
    println!("Wrote {}", path.display());
    Ok(())
}
