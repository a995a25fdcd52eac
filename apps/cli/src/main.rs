use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use notesync_core::{fetch_schema, scan_documents, Document, SyncCoordinator};

mod client;
mod collect;
mod config;
mod data;

use client::{launch_anki, service_addr, wait_for_port, HttpAnki};
use collect::Collector;
use config::Config;
use data::DataFile;

#[derive(Parser)]
#[command(name = "notesync")]
#[command(about = "Add cards to Anki from markdown or text files", long_about = None)]
#[command(version)]
struct Cli {
    /// File or directory to scan
    path: Option<PathBuf>,

    /// Recursively scan subfolders
    #[arg(short = 'R', long)]
    recurse: bool,

    /// Also search for notes with the custom note patterns
    #[arg(short, long)]
    regex: bool,

    /// Add entries for new note types to the config file
    #[arg(short, long)]
    update: bool,

    /// Upload every referenced media file again
    #[arg(short, long = "mediaupdate")]
    media_update: bool,

    /// Print the config file location and exit
    #[arg(short, long)]
    config: bool,

    /// Use this config file instead of the default one
    #[arg(long, value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Use this data file instead of the default one
    #[arg(long, value_name = "FILE")]
    data_file: Option<PathBuf>,

    /// Scan files even if they have not changed since the last sync
    #[arg(long)]
    all: bool,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = cli.config_file.clone().unwrap_or_else(Config::default_path);
    if cli.config {
        println!("{}", config_path.display());
        return Ok(());
    }
    let mut config = Config::load_or_create(&config_path).context("failed to load config")?;

    let data_path = cli.data_file.clone().unwrap_or_else(DataFile::default_path);
    let mut data = DataFile::load(&data_path).context("failed to load data file")?;
    if cli.media_update {
        data.reset_media();
        data.save(&data_path)?;
    }

    if cli.path.is_none() && !cli.update {
        if !cli.media_update {
            Cli::command().print_help()?;
        }
        return Ok(());
    }

    ensure_anki(&config).await?;
    let coordinator = SyncCoordinator::new(HttpAnki::new(config.anki.url.clone()));

    if cli.update {
        let schema = fetch_schema(coordinator.service())
            .await
            .context("failed to fetch note types")?;
        config.update_note_types(schema.note_types());
        config.save_to_path(&config_path)?;
        tracing::info!(path = %config_path.display(), "config file updated");
    }

    let Some(target) = cli.path.as_deref() else {
        return Ok(());
    };

    let mut settings = config.settings();
    settings.regex_mode |= cli.regex;
    let mut ctx = coordinator
        .prepare(settings, data.media_state())
        .await
        .context("failed to load note types and IDs")?;
    data.restore(&mut ctx);

    let collector = Collector::new(
        &config.folders,
        Some(config.defaults.vault_name.as_str()),
        cli.recurse,
    )?;
    let mut documents = Vec::new();
    for source in collector.collect(target)? {
        let text = fs::read_to_string(&source.path)
            .with_context(|| format!("failed to read {}", source.path.display()))?;
        if !cli.all && data.is_unchanged(&source.path, &text) {
            tracing::debug!(path = %source.path.display(), "unchanged since last sync");
            continue;
        }
        tracing::info!(path = %source.path.display(), "scanning");
        documents.push(Document::new(source.path, text, source.options));
    }
    if documents.is_empty() {
        tracing::info!("nothing to sync");
        return Ok(());
    }

    let mut report = scan_documents(documents, &mut ctx)?;
    for error in &report.failed {
        eprintln!("skipped {error}");
        data.forget_file(&error.path);
    }

    let stats = coordinator.sync(&mut report.documents, &mut ctx).await?;

    data.record_documents(&report.documents);
    data.record_sync(&ctx, chrono::Utc::now());
    data.save(&data_path).context("failed to save data file")?;

    println!(
        "{} added, {} updated, {} deleted, {} media uploaded, {} files written",
        stats.notes_added,
        stats.notes_updated,
        stats.notes_deleted,
        stats.media_uploaded,
        stats.files_written
    );
    if stats.write_failures > 0 {
        bail!("{} files could not be written", stats.write_failures);
    }
    Ok(())
}

/// Make sure the service is reachable, starting Anki if it is configured.
async fn ensure_anki(config: &Config) -> Result<()> {
    let addr = service_addr(&config.anki.url)
        .with_context(|| format!("invalid service URL {}", config.anki.url))?;
    let timeout = Duration::from_secs(config.anki.connect_timeout_secs);

    tracing::info!(%addr, "connecting to Anki");
    if wait_for_port(&addr, timeout).await {
        return Ok(());
    }

    let Some(path) = config.anki_path().filter(|_| !config.anki.profile.is_empty()) else {
        bail!("cannot reach Anki at {addr}; set anki.path and anki.profile to start it automatically");
    };
    launch_anki(&path, &config.anki.profile)
        .with_context(|| format!("failed to start {}", path.display()))?;
    if !wait_for_port(&addr, timeout).await {
        bail!("started Anki, but cannot connect to {addr}; is AnkiConnect installed?");
    }
    tracing::info!("connected to Anki");
    Ok(())
}
