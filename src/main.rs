mod cli;

use taxi_backend::config;
use taxi_db::{global, Database};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "taxi_backend=debug,taxi_db=debug".to_string()
        } else {
            "taxi_backend=info,taxi_db=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Check { json } => check(cli.config.as_deref(), cli.database, json),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("taxi {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Build the process-wide database handles from configuration.
fn startup(config_path: Option<&Path>, database: Option<PathBuf>) -> Result<&'static Database> {
    let mut config = config::load_config_or_default(config_path)?;

    if let Some(path) = database {
        config.database.path = path;
        config.database.url = None;
    }

    let db = Database::open(&config.database.to_options())
        .context("Failed to configure database")?;
    let db = global::install(db)?;

    tracing::debug!("Database handles installed for {}", db.engine().url());
    Ok(db)
}

fn check(config_path: Option<&Path>, database: Option<PathBuf>, json: bool) -> Result<()> {
    let db = startup(config_path, database)?;
    let engine = db.engine();

    let version = engine
        .sqlite_version()
        .with_context(|| format!("Failed to connect to {}", engine.url()))?;
    let tables = engine.table_names()?;

    if json {
        let report = serde_json::json!({
            "url": engine.url(),
            "path": db.path().map(|p| p.display().to_string()),
            "sqlite_version": version,
            "tables": tables,
            "engine": engine.options(),
            "session": db.sessions().options(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Database: {}", engine.url());
        println!("SQLite: {}", version);
        println!(
            "Engine: echo={}, future={}",
            engine.options().echo,
            engine.options().future
        );
        println!(
            "Sessions: autoflush={}, future={}",
            db.sessions().options().autoflush,
            db.sessions().options().future
        );
        println!("Tables: {}", tables.len());
        for table in &tables {
            println!("  {}", table);
        }
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            print_database_config(&config.database);
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            print_database_config(&config.database);
        }
    }

    Ok(())
}

fn print_database_config(db: &config::DatabaseConfig) {
    match db.url {
        Some(ref url) => println!("  Database URL: {}", url),
        None => println!("  Database path: {}", db.path.display()),
    }
    println!("  Echo: {}", db.echo);
    println!("  Future: {}", db.future);
    println!("  Autoflush: {}", db.autoflush);
}
