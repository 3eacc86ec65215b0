use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use book_pipeline_core::catalog::{BookCatalog, JsonCatalog};
use book_pipeline_core::config::{
    config_path, limits_from_config, load_config, storage_root, AppConfig,
};
use book_pipeline_core::error::{IngestError, StoreError};
use book_pipeline_core::id::BookId;
use book_pipeline_core::ingest::Ingestor;
use book_pipeline_core::persist::BookStore;
use book_pipeline_core::progress::{IngestStage, ProgressEvent, ProgressHandler};
use book_pipeline_core::upload::UploadedAsset;

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "book-pipeline")]
#[command(about = "Ingest, inspect and read books in a book-pipeline store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Storage root (defaults to the configured root)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion pipeline and publish a book
    Ingest {
        /// Upload file (.epub, .zip, .html, .htm, .xhtml, .txt)
        #[arg(required = true)]
        input: String,

        /// Book identifier ([A-Za-z0-9_-], up to 64 characters)
        #[arg(long, required = true)]
        book_id: String,

        /// Declared media type of the upload
        #[arg(long)]
        media_type: Option<String>,
    },

    /// Validate, extract, parse and sanitize without publishing
    Inspect {
        /// Upload file
        #[arg(required = true)]
        input: String,

        /// Book identifier used to build resource URLs
        #[arg(long, default_value = "preview")]
        book_id: String,
    },

    /// Show the table of contents of a published book
    Toc {
        #[arg(required = true)]
        book_id: String,
    },

    /// Print the sanitized HTML of one chapter
    Chapter {
        #[arg(required = true)]
        book_id: String,

        #[arg(required = true)]
        chapter_id: String,
    },

    /// Show the catalog row of a book
    Status {
        #[arg(required = true)]
        book_id: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Initialize default config file
    Init,
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Key (dot-separated path)
        key: String,
        /// Value
        value: String,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = load_config();
    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| storage_root(&config.storage));

    let result = match &cli.command {
        Commands::Ingest {
            input,
            book_id,
            media_type,
        } => run_ingest(&config, &root, input, book_id, media_type.as_deref(), cli.json),
        Commands::Inspect { input, book_id } => run_inspect(&config, &root, input, book_id, cli.json),
        Commands::Toc { book_id } => run_toc(&root, book_id, cli.json),
        Commands::Chapter {
            book_id,
            chapter_id,
        } => run_chapter(&root, book_id, chapter_id),
        Commands::Status { book_id } => run_status(&root, book_id, cli.json),
        Commands::Config { action } => run_config(action, cli.json),
    };

    if let Err(e) = result {
        match e.downcast_ref::<IngestError>() {
            Some(ingest) => eprintln!("Error [{}]: {}", ingest.kind(), e),
            None => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
}

/// Renders ingestion stages as a progress bar on stderr.
struct BarProgress(ProgressBar);

impl BarProgress {
    fn new(hidden: bool) -> Self {
        if hidden {
            return Self(ProgressBar::hidden());
        }
        let bar = ProgressBar::new(IngestStage::ALL.len() as u64);
        if let Ok(style) = ProgressStyle::with_template("{bar:20} {pos}/{len} {msg}") {
            bar.set_style(style);
        }
        Self(bar)
    }
}

impl ProgressHandler for BarProgress {
    fn on_progress(&self, event: ProgressEvent) {
        self.0.set_length(event.total);
        self.0.set_position(event.current);
        self.0.set_message(event.stage.to_string());
    }
}

fn read_upload(input: &str, media_type: Option<&str>) -> Result<UploadedAsset, Box<dyn std::error::Error + Send + Sync>> {
    let path = Path::new(input);
    let bytes = std::fs::read(path).map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or("Input path has no file name")?
        .to_string();
    Ok(UploadedAsset {
        filename,
        media_type: media_type.map(str::to_string),
        bytes,
    })
}

fn ingestor(config: &AppConfig, root: &Path) -> Ingestor {
    Ingestor::new(
        BookStore::new(root),
        Arc::new(JsonCatalog::in_root(root)),
        limits_from_config(config),
    )
    .with_resource_url_prefix(config.serving.resource_url_prefix.clone())
}

fn run_ingest(
    config: &AppConfig,
    root: &Path,
    input: &str,
    book_id: &str,
    media_type: Option<&str>,
    json: bool,
) -> CliResult {
    let book_id = BookId::parse(book_id)?;
    let upload = read_upload(input, media_type)?;
    let progress = BarProgress::new(json);
    let report = ingestor(config, root).ingest(&book_id, upload, Some(&progress));
    progress.0.finish_and_clear();
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Published: {} (version {})", report.book_id, report.version);
    println!("  Format:     {}", report.source_format.as_str());
    println!("  Chapters:   {}", report.chapter_count);
    println!("  Resources:  {}", report.resource_count);
    println!("  Words:      {} (~{} min)", report.word_count, report.reading_minutes);
    println!("  Hash:       {}{}", report.content_hash, if report.changed { "" } else { " (unchanged)" });
    for dropped in &report.dropped_entries {
        println!("  Dropped:    {} ({})", dropped.path, dropped.reason);
    }
    for broken in &report.broken_references {
        println!("  Broken:     {} in {} ({})", broken.reference, broken.chapter_id, broken.reason);
    }
    for chapter in &report.truncated_chapters {
        println!("  Truncated:  {}", chapter);
    }
    Ok(())
}

fn run_inspect(config: &AppConfig, root: &Path, input: &str, book_id: &str, json: bool) -> CliResult {
    let book_id = BookId::parse(book_id)?;
    let upload = read_upload(input, None)?;
    let inspection = ingestor(config, root).inspect(&book_id, &upload, None)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
        return Ok(());
    }
    println!("Format:    {}", inspection.source_format.as_str());
    if let Some(title) = &inspection.metadata.title {
        println!("Title:     {}", title);
    }
    if !inspection.metadata.authors.is_empty() {
        println!("Authors:   {}", inspection.metadata.authors.join(", "));
    }
    println!("Words:     {} (~{} min)", inspection.word_count, inspection.reading_minutes);
    println!("Resources: {}", inspection.resources.len());
    println!("Chapters:");
    for chapter in &inspection.chapters {
        println!("  {:>3}. {} [{}] {} words", chapter.index + 1, chapter.title, chapter.id, chapter.word_count);
    }
    for dropped in &inspection.dropped_entries {
        println!("Dropped:   {} ({})", dropped.path, dropped.reason);
    }
    for broken in &inspection.broken_references {
        println!("Broken:    {} in {} ({})", broken.reference, broken.chapter_id, broken.reason);
    }
    Ok(())
}

fn run_toc(root: &Path, book_id: &str, json: bool) -> CliResult {
    let book_id = BookId::parse(book_id)?;
    let descriptor = BookStore::new(root).load_descriptor(&book_id)?;
    let toc = descriptor.table_of_contents();

    if json {
        println!("{}", serde_json::to_string_pretty(&toc)?);
        return Ok(());
    }
    println!("{}", toc.title.as_deref().unwrap_or(toc.book_id.as_str()));
    for entry in &toc.chapters {
        println!("  {:>3}. {} [{}]", entry.index + 1, entry.title, entry.id);
    }
    Ok(())
}

fn run_chapter(root: &Path, book_id: &str, chapter_id: &str) -> CliResult {
    let book_id = BookId::parse(book_id)?;
    let store = BookStore::new(root);
    let descriptor = store.load_descriptor(&book_id)?;
    let entry = descriptor
        .chapter(chapter_id)
        .ok_or_else(|| format!("No chapter {} in book {}", chapter_id, book_id))?;
    let html = store.read_file(&book_id, &descriptor.version, &entry.file)?;
    println!("{}", String::from_utf8_lossy(&html));
    Ok(())
}

fn run_status(root: &Path, book_id: &str, json: bool) -> CliResult {
    let book_id = BookId::parse(book_id)?;
    let record = JsonCatalog::in_root(root)
        .get(&book_id)?
        .ok_or_else(|| StoreError::Missing(book_id.to_string()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }
    println!("{}: {:?}", record.book_id, record.status);
    if let Some(hash) = &record.content_hash {
        println!("  Hash:     {}", hash);
    }
    println!("  Chapters: {}", record.chapter_count);
    if let (Some(kind), Some(error)) = (&record.error_kind, &record.error) {
        println!("  Error:    [{}] {}", kind, error);
    }
    Ok(())
}

fn run_config(action: &ConfigAction, json: bool) -> CliResult {
    match action {
        ConfigAction::Init => {
            let path = config_path().ok_or("Could not determine config directory")?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let toml = toml::to_string_pretty(&AppConfig::default())?;
            std::fs::write(&path, toml)?;
            println!("Wrote default config to {}", path.display());
        }
        ConfigAction::Show => {
            let cfg = load_config();
            if json {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            } else {
                println!("{}", toml::to_string_pretty(&cfg)?);
            }
        }
        ConfigAction::Set { key, value } => {
            let path = config_path().ok_or("Could not determine config directory")?;
            let mut cfg: AppConfig = if path.exists() {
                let s = std::fs::read_to_string(&path)?;
                toml::from_str(&s)?
            } else {
                AppConfig::default()
            };

            set_config_key(&mut cfg, key, value)?;

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, toml::to_string_pretty(&cfg)?)?;
            if !json {
                println!("Updated {}", key);
            }
        }
    }
    Ok(())
}

fn set_config_key(cfg: &mut AppConfig, key: &str, value: &str) -> CliResult {
    fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
        value
            .parse()
            .map_err(|_| format!("{} expects a number, got {:?}", key, value))
    }

    match key.split_once('.') {
        Some(("storage", "root")) => cfg.storage.root = Some(value.to_string()),
        Some(("limits", sub)) => {
            let n = Some(number(key, value)?);
            match sub {
                "max_upload_mb" => cfg.limits.max_upload_mb = n,
                "max_file_count" => cfg.limits.max_file_count = n,
                "max_entry_mb" => cfg.limits.max_entry_mb = n,
                "max_total_mb" => cfg.limits.max_total_mb = n,
                "max_compression_ratio" => cfg.limits.max_compression_ratio = n,
                "max_extract_seconds" => cfg.limits.max_extract_seconds = n,
                _ => return Err(format!("Unknown key: {}", key).into()),
            }
        }
        Some(("sanitize", sub)) => match sub {
            "max_nesting_depth" => cfg.sanitize.max_nesting_depth = Some(number(key, value)?),
            "max_input_kb" => cfg.sanitize.max_input_kb = Some(number(key, value)?),
            "max_unit_kb" => cfg.sanitize.max_unit_kb = Some(number(key, value)?),
            "max_document_kb" => cfg.sanitize.max_document_kb = Some(number(key, value)?),
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        Some(("entitlement", sub)) => match sub {
            "url" => cfg.entitlement.url = Some(value.to_string()),
            "timeout_ms" => cfg.entitlement.timeout_ms = number(key, value)?,
            "grants" => {
                cfg.entitlement.grants = value
                    .split(',')
                    .map(|g| g.trim().to_string())
                    .filter(|g| !g.is_empty())
                    .collect()
            }
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        Some(("serving", sub)) => match sub {
            "bind" => cfg.serving.bind = value.to_string(),
            "resource_url_prefix" => cfg.serving.resource_url_prefix = value.to_string(),
            "descriptor_cache_size" => cfg.serving.descriptor_cache_size = number(key, value)?,
            "admin_token" => cfg.serving.admin_token = Some(value.to_string()),
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        _ => return Err(format!("Unknown key: {}", key).into()),
    }
    Ok(())
}
