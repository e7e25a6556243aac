use anyhow::{Context, Result};
use auditkeep::{
    collections::{Category, RestoreMode},
    config::{ServiceConfig, DEFAULT_CONFIG_FILE},
    core::{CreateBackupRequest, RestoreRequest},
    observability::{init_logging, shutdown_logging},
    BackupError, BackupService,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

const PASSWORD_ENV: &str = "AUDITKEEP_PASSWORD";

enum Command {
    List,
    Info { slug: String },
    Create(CreateBackupRequest),
    Restore(RestoreRequest),
    Delete { slug: String },
    Status,
    Recover,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            match e.downcast_ref::<BackupError>() {
                Some(backup_err) => {
                    eprintln!("Error [{}]: {}", backup_err.kind().as_str(), backup_err.public_message());
                }
                None => eprintln!("Error: {:#}", e),
            }
            1
        }
    };

    shutdown_logging();
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config_path = take_option(&mut args, "--config")?
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let command = parse_command(args)?;

    let config = ServiceConfig::load(&config_path).await
        .context("Failed to load configuration")?;

    init_logging(
        &config.log_level,
        config.log_directory.as_deref(),
        config.log_rotation.into(),
    )?;

    info!("AuditKeep v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", config_path.display());

    let service = BackupService::from_config(&config).await?;

    match command {
        Command::List => print_json(&service.list_backups().await?),
        Command::Info { slug } => print_json(&service.backup_info(&slug).await?),
        Command::Create(request) => print_json(&service.create_backup(request).await?),
        Command::Restore(request) => print_json(&service.restore_backup(request).await?),
        Command::Delete { slug } => {
            service.delete_backup(&slug).await?;
            print_json(&serde_json::json!({ "deleted": slug }))
        }
        Command::Status => print_json(&service.status().await),
        Command::Recover => print_json(&service.recover().await?),
    }
}

fn parse_command(mut args: Vec<String>) -> Result<Command> {
    let password = take_option(&mut args, "--password")?
        .or_else(|| std::env::var(PASSWORD_ENV).ok())
        .filter(|p| !p.is_empty());
    let categories = match take_option(&mut args, "--categories")? {
        Some(list) => parse_categories(&list)?,
        None => Vec::new(),
    };
    let mode = match take_option(&mut args, "--mode")? {
        Some(mode) => mode.parse::<RestoreMode>().map_err(anyhow::Error::msg)?,
        None => RestoreMode::default(),
    };

    if let Some(unknown) = args.iter().find(|a| a.starts_with("--")) {
        anyhow::bail!("Unknown option: {}", unknown);
    }

    let mut args = args.into_iter();
    let name = args.next().unwrap_or_default();
    let operand = args.next();
    if let Some(extra) = args.next() {
        anyhow::bail!("Unexpected argument: {}", extra);
    }

    let required = |what: &str| {
        operand
            .clone()
            .ok_or_else(|| anyhow::anyhow!("'{}' requires a {} argument", name, what))
    };

    let command = match name.as_str() {
        "list" => Command::List,
        "status" => Command::Status,
        "recover" => Command::Recover,
        "info" => Command::Info { slug: required("slug")? },
        "delete" => Command::Delete { slug: required("slug")? },
        "create" => Command::Create(CreateBackupRequest {
            name: required("name")?,
            password,
            categories: if categories.is_empty() {
                Category::SELECTABLE.to_vec()
            } else {
                categories
            },
        }),
        "restore" => Command::Restore(RestoreRequest {
            slug: required("slug")?,
            password,
            categories,
            mode,
        }),
        other => anyhow::bail!("Unknown command: '{}'. Run with --help for usage", other),
    };

    Ok(command)
}

/// Remove `--flag VALUE` from `args`, returning the value
fn take_option(args: &mut Vec<String>, flag: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };

    if pos + 1 >= args.len() {
        anyhow::bail!("{} requires a value", flag);
    }

    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn parse_categories(list: &str) -> Result<Vec<Category>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Category>().map_err(anyhow::Error::msg))
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

fn print_help() {
    println!("AuditKeep v{} - Backup and restore for audit data", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  auditkeep [--config FILE] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("  list                                   List backups (and unreadable archives)");
    println!("  info <SLUG>                            Show one backup's manifest");
    println!("  create <NAME> [--password P] [--categories A,B]");
    println!("                                         Create a backup (all categories by default)");
    println!("  restore <SLUG> [--password P] [--categories A,B] [--mode upsert|revert]");
    println!("                                         Restore a backup (all its categories by default)");
    println!("  delete <SLUG>                          Delete a backup");
    println!("  status                                 Show the current operation phase");
    println!("  recover                                Clean up after an operation whose process died");
    println!();
    println!("OPTIONS:");
    println!("  --config FILE     Configuration file (default: {})", DEFAULT_CONFIG_FILE);
    println!("  --help            Show this help");
    println!();
    println!("The password may also be supplied via {}.", PASSWORD_ENV);
    println!();
    println!("EXAMPLES:");
    println!("  auditkeep create Nightly --categories Users,Clients");
    println!("  auditkeep restore 3f2a9c... --mode revert");
}
