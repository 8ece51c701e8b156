use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use metis_migrate::config::{ConfigOverrides, MigrationConfig};
use metis_migrate::inspect::{inspect_user, print_inspection};
use metis_migrate::legacy::{CollectionEntry, CollectionStore};
use metis_migrate::migration::{print_summary, run_migration, MigrationOptions};
use metis_migrate::target::RelationalStore;
use metis_migrate::{logging, prompt};

#[derive(Debug, Parser)]
#[command(
    name = "metis-migrate",
    about = "Migrate MetisAgent user data from the legacy collection into SQLite",
    version
)]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct PathArgs {
    /// Directory holding the legacy `<collection>.jsonl` files.
    #[arg(long = "legacy", global = true, value_name = "DIR")]
    legacy_root: Option<PathBuf>,
    /// Legacy collection name.
    #[arg(long, global = true)]
    collection: Option<String>,
    /// Target SQLite database.
    #[arg(long = "target", global = true, value_name = "FILE")]
    target_db: Option<PathBuf>,
    /// Where the report, log and backups are written.
    #[arg(long, global = true, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Do not snapshot the legacy store before migrating.
    #[arg(long)]
    skip_backup: bool,
    /// User whose migrated attributes are sampled into the report.
    #[arg(long, value_name = "USER_ID")]
    sample_user: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Back up, migrate, validate and report (the default).
    Run(RunArgs),
    /// Show a user's migrated attributes without their values.
    Inspect {
        #[arg(long)]
        user: String,
    },
    /// Add an API key record to the legacy collection.
    SeedKey {
        #[arg(long)]
        user: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        encrypted: bool,
    },
    /// Delete every user and attribute from the target database.
    Purge {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    match handle_cli(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn handle_cli(cli: Cli) -> Result<i32> {
    let config = MigrationConfig::resolve(ConfigOverrides {
        legacy_root: cli.paths.legacy_root,
        collection: cli.paths.collection,
        target_db: cli.paths.target_db,
        output_dir: cli.paths.output_dir,
    })
    .context("resolve configuration")?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => handle_run(&config, args),
        Commands::Inspect { user } => handle_inspect(&config, &user),
        Commands::SeedKey {
            user,
            service,
            key,
            encrypted,
        } => handle_seed_key(&config, &user, &service, &key, encrypted),
        Commands::Purge { yes } => handle_purge(&config, yes),
    }
}

fn handle_run(config: &MigrationConfig, args: RunArgs) -> Result<i32> {
    // Dropped on return so the file sink flushes before exit.
    let _guard = logging::init(Some(&config.output_dir)).context("initialise logging")?;

    let legacy = CollectionStore::open(&config.legacy_root, &config.collection)
        .context("open legacy collection")?;
    let target = RelationalStore::open(&config.target_db).context("open target database")?;

    let options = MigrationOptions {
        skip_backup: args.skip_backup,
        sample_user: args.sample_user,
    };
    let outcome = run_migration(config, &legacy, &target, &options).context("migration failed")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    print_summary(&outcome.report, &mut out).context("print summary")?;
    writeln!(out, "Report written to {}", outcome.report_path.display())?;
    Ok(0)
}

fn handle_inspect(config: &MigrationConfig, user: &str) -> Result<i32> {
    let _guard = logging::init(None).context("initialise logging")?;
    let target = RelationalStore::open(&config.target_db).context("open target database")?;
    let inspection = inspect_user(&target, user)?;
    print_inspection(&inspection, &mut io::stdout().lock())?;
    Ok(0)
}

fn handle_seed_key(
    config: &MigrationConfig,
    user: &str,
    service: &str,
    key: &str,
    encrypted: bool,
) -> Result<i32> {
    let _guard = logging::init(None).context("initialise logging")?;
    let mut legacy = CollectionStore::open(&config.legacy_root, &config.collection)
        .context("open legacy collection")?;
    if !legacy.contains_user(user) {
        legacy.upsert_record(CollectionEntry::user(user, None))?;
    }
    legacy.upsert_record(CollectionEntry::api_key(user, service, key, encrypted))?;
    tracing::info!(
        target: "metis_migrate",
        event = "key_seeded",
        user_id = user,
        service,
        encrypted
    );
    println!("Seeded {service} key for {user} in {}", legacy.path().display());
    Ok(0)
}

fn handle_purge(config: &MigrationConfig, yes: bool) -> Result<i32> {
    let _guard = logging::init(None).context("initialise logging")?;
    if !yes {
        let question = format!(
            "Delete every user and attribute from {}?",
            config.target_db.display()
        );
        let confirmed = prompt::confirm(&question, &mut io::stdin().lock(), &mut io::stdout())
            .context("read confirmation")?;
        if !confirmed {
            println!("Aborted.");
            return Ok(0);
        }
    }
    let target = RelationalStore::open(&config.target_db).context("open target database")?;
    let counts = target.purge()?;
    println!(
        "Purged {} users and {} attributes.",
        counts.users, counts.attributes
    );
    Ok(0)
}
