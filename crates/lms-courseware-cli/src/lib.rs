//! Administrative command surface for courseware maintenance.
//!
//! Host binaries embed this crate through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_courseware`] / [`run_commerce`] for direct command execution
//!   against already-opened stores.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lms_courseware_core::{
    parse_window_bound, CommerceConfiguration, CommerceConfigurationInput,
    Reconciler, RunReport, COMMERCE_API_NAME, COMMERCE_CACHE_KEY,
};
use lms_courseware_store_sqlite::SqliteCoursewareStore;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lms-admin")]
#[command(about = "LMS courseware maintenance CLI")]
pub struct Cli {
    /// Primary (writable) database.
    #[arg(long, default_value = "./lms.sqlite3")]
    db: PathBuf,

    /// Read replica used for scans. Defaults to the primary.
    #[arg(long)]
    replica_db: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Courseware {
        #[command(subcommand)]
        command: Box<CoursewareCommand>,
    },
    Commerce {
        #[command(subcommand)]
        command: Box<CommerceCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum CoursewareCommand {
    /// Fix progress rows whose course_id was written with a trailing newline.
    FixNewlines(FixNewlinesArgs),
    /// List progress rows with a trailing newline in course_id.
    ListMalformed(WindowArgs),
}

impl CoursewareCommand {
    /// Dry runs and previews only read, so the primary is opened read-only.
    #[must_use]
    pub fn writes_primary(&self) -> bool {
        match self {
            Self::FixNewlines(args) => !args.dry_run,
            Self::ListMalformed(_) => false,
        }
    }
}

#[derive(Debug, Args)]
pub struct WindowArgs {
    /// Window start, e.g. "2016-08-23 16:43:00" or 2016-08-23T16:43:00Z.
    start: String,
    /// Window end (inclusive).
    end: String,
}

#[derive(Debug, Args)]
pub struct FixNewlinesArgs {
    #[command(flatten)]
    window: WindowArgs,
    /// Run read queries and report what would change without writing.
    #[arg(long, alias = "dry_run")]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
pub enum CommerceCommand {
    Show,
    Set(CommerceSetArgs),
    History(CommerceHistoryArgs),
    Site {
        #[command(subcommand)]
        command: Box<SiteCommand>,
    },
}

#[derive(Debug, Args)]
pub struct CommerceSetArgs {
    #[arg(long)]
    changed_by: String,
    #[arg(long)]
    enabled: Option<bool>,
    #[arg(long)]
    checkout_on_ecommerce_service: Option<bool>,
    #[arg(long)]
    single_course_checkout_page: Option<String>,
    #[arg(long)]
    cache_ttl: Option<u32>,
    #[arg(long, conflicts_with = "clear_site")]
    site_id: Option<i64>,
    #[arg(long)]
    clear_site: bool,
}

#[derive(Debug, Args)]
pub struct CommerceHistoryArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum SiteCommand {
    Set(SiteSetArgs),
}

#[derive(Debug, Args)]
pub struct SiteSetArgs {
    #[arg(long)]
    domain: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    receipt_page: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommerceView<'a> {
    api_name: &'static str,
    cache_key: &'static str,
    receipt_page_url: String,
    is_cache_enabled: bool,
    configuration: &'a CommerceConfiguration,
}

impl<'a> CommerceView<'a> {
    fn new(configuration: &'a CommerceConfiguration) -> Self {
        Self {
            api_name: COMMERCE_API_NAME,
            cache_key: COMMERCE_CACHE_KEY,
            receipt_page_url: configuration.receipt_page_url(),
            is_cache_enabled: configuration.is_cache_enabled(),
            configuration,
        }
    }
}

/// Installs the global `tracing` subscriber. Logs go to stderr so stdout
/// stays machine-readable; `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if let Err(err) = result {
        eprintln!("tracing subscriber already installed: {err}");
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when arguments are invalid, the stores cannot be
/// opened or migrated, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Courseware { command } => {
            // Arguments are checked before either database is touched, and
            // courseware commands never create or migrate the primary.
            let window = parse_window(&command)?;
            let primary = if command.writes_primary() {
                SqliteCoursewareStore::open_existing(&cli.db)?
            } else {
                SqliteCoursewareStore::open_read_only(&cli.db)?
            };
            match cli.replica_db {
                Some(path) => {
                    let replica = SqliteCoursewareStore::open_read_only(&path)?;
                    run_courseware(*command, window, &replica, &primary)
                }
                None => run_courseware(*command, window, &primary, &primary),
            }
        }
        Command::Commerce { command } => {
            let store = SqliteCoursewareStore::open(&cli.db)?;
            store.migrate()?;
            run_commerce(*command, &store)
        }
    }
}

fn parse_window(command: &CoursewareCommand) -> Result<(OffsetDateTime, OffsetDateTime)> {
    let window = match command {
        CoursewareCommand::FixNewlines(args) => &args.window,
        CoursewareCommand::ListMalformed(args) => args,
    };

    let start = parse_window_bound(&window.start)
        .map_err(|err| anyhow!("invalid <START> value: {err}"))?;
    let end =
        parse_window_bound(&window.end).map_err(|err| anyhow!("invalid <END> value: {err}"))?;

    if start > end {
        return Err(anyhow!(
            "<START> ({}) must not be after <END> ({})",
            window.start,
            window.end
        ));
    }
    Ok((start, end))
}

/// Executes a courseware command with an explicit read path and primary.
///
/// # Errors
/// Returns an error when the candidate scan fails or output cannot be
/// serialized. Per-row repair failures are reported in the summary instead.
pub fn run_courseware(
    command: CoursewareCommand,
    window: (OffsetDateTime, OffsetDateTime),
    read_path: &SqliteCoursewareStore,
    primary: &SqliteCoursewareStore,
) -> Result<()> {
    let (start, end) = window;
    match command {
        CoursewareCommand::FixNewlines(args) => {
            let report: RunReport =
                Reconciler::new(read_path, primary).run(start, end, args.dry_run)?;
            info!(
                rows_detected = report.rows_detected,
                mode = report.mode.as_str(),
                "fix-newlines complete"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        CoursewareCommand::ListMalformed(_) => {
            let rows = read_path.list_malformed(start, end)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
    }
}

/// Executes a commerce configuration command.
///
/// # Errors
/// Returns an error when validation or persistence fails.
pub fn run_commerce(command: CommerceCommand, store: &SqliteCoursewareStore) -> Result<()> {
    match command {
        CommerceCommand::Show => {
            let current = store.current_commerce_configuration()?;
            println!("{}", serde_json::to_string_pretty(&CommerceView::new(&current))?);
            Ok(())
        }
        CommerceCommand::Set(args) => {
            let current = store.current_commerce_configuration()?;
            let mut input = CommerceConfigurationInput::from_current(&current);
            input.changed_by = Some(args.changed_by);
            if let Some(enabled) = args.enabled {
                input.enabled = enabled;
            }
            if let Some(value) = args.checkout_on_ecommerce_service {
                input.checkout_on_ecommerce_service = value;
            }
            if let Some(page) = args.single_course_checkout_page {
                input.single_course_checkout_page = page;
            }
            if let Some(ttl) = args.cache_ttl {
                input.cache_ttl = ttl;
            }
            if args.clear_site {
                input.site_id = None;
            } else if let Some(site_id) = args.site_id {
                input.site_id = Some(site_id);
            }

            let saved = store.save_commerce_configuration(&input)?;
            println!("{}", serde_json::to_string_pretty(&CommerceView::new(&saved))?);
            Ok(())
        }
        CommerceCommand::History(args) => {
            let history = store.commerce_configuration_history(args.limit)?;
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
        CommerceCommand::Site { command } => match *command {
            SiteCommand::Set(args) => {
                let site = store
                    .upsert_site(&args.domain, &args.name, args.receipt_page.as_deref())
                    .with_context(|| format!("failed to record site {}", args.domain))?;
                println!("{}", serde_json::to_string_pretty(&site)?);
                Ok(())
            }
        },
    }
}

