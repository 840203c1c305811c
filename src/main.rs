//! Invite Scraper Bot - Main Entry Point
//!
//! A Telegram userbot that scrapes members from source groups and invites
//! them into a target group, spreading the work across a pool of accounts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Select};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use invite_scraper_bot::config::{AppConfig, Settings};
use invite_scraper_bot::frontend::{self, FrontendHandle, Prompt, RunEvent, RunInput};
use invite_scraper_bot::scheduler::{Orchestrator, RunMode};
use invite_scraper_bot::store::{Account, Group, GroupRole, Ledger, NewAccount, SqliteLedger};
use invite_scraper_bot::telegram::{AccountSession, SessionConnector, TelegramConnector};

/// Multi-account Telegram userbot for group member scraping and inviting.
#[derive(Parser, Debug)]
#[command(name = "invite_scraper")]
#[command(about = "Scrape group members and invite them into a target group")]
#[command(version)]
struct Args {
    /// Path to the runtime settings JSON file.
    #[arg(short, long, default_value = "settings.json")]
    settings: PathBuf,

    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Ledger database path, overriding the environment.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start an invite run across all eligible accounts.
    Run {
        /// Keep running, repeating after the configured pause.
        #[arg(long)]
        repeat: bool,
    },
    /// Import accounts from a JSON file.
    ImportAccounts {
        /// File containing an array of accounts.
        file: PathBuf,
    },
    /// Register a group by invite link.
    AddGroup {
        /// Invite link (t.me/+hash or t.me/username).
        link: String,
        /// Register as the invite target instead of a source.
        #[arg(long)]
        target: bool,
    },
    /// Show all stored accounts.
    ListAccounts,
    /// Show all stored groups.
    ListGroups,
    /// Pick the target group from an account's dialogs.
    ChooseTarget,
    /// Change the per-account invite ceiling.
    SetLimit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load environment variables
    if let Err(e) = dotenvy::from_filename(&args.env_file) {
        debug!("Could not load .env file ({}): {}", args.env_file, e);
    }

    let settings =
        Settings::load(&args.settings).context("Failed to load runtime settings")?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&settings.log_level);
    init_logging(level);

    let mut config = AppConfig::from_env();
    if let Some(db) = args.db {
        config.database_path = db;
    }
    let ledger = SqliteLedger::open(&config.database_path)
        .await
        .with_context(|| {
            format!("Failed to open ledger at {}", config.database_path.display())
        })?;

    match args.command {
        Command::Run { repeat } => run(args.settings, settings, config, ledger, repeat).await,
        Command::ImportAccounts { file } => import_accounts(&ledger, &file).await,
        Command::AddGroup { link, target } => add_group(&ledger, &link, target).await,
        Command::ListAccounts => list_accounts(&ledger).await,
        Command::ListGroups => list_groups(&ledger).await,
        Command::ChooseTarget => choose_target(settings, config, ledger).await,
        Command::SetLimit => set_limit(&args.settings, settings).await,
    }
}

/// Initializes the logging subsystem.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn connector(settings: &Settings, config: &AppConfig) -> TelegramConnector {
    let proxy = settings
        .use_proxy
        .then_some(config.proxy_url.as_deref())
        .flatten();
    TelegramConnector::new(
        config.sessions_dir.clone(),
        (settings.page_delay_min_ms, settings.page_delay_max_ms),
        proxy,
    )
}

async fn run(
    settings_path: PathBuf,
    settings: Settings,
    config: AppConfig,
    ledger: SqliteLedger,
    repeat: bool,
) -> Result<()> {
    let connector = connector(&settings, &config);
    let mode = if repeat {
        RunMode::Every(Duration::from_secs(settings.repeat_interval_hours * 3600))
    } else {
        RunMode::Once
    };

    let orchestrator = Orchestrator::new(Arc::new(ledger), Arc::new(connector), settings);
    let (core, front) = frontend::link();
    let pump = tokio::spawn(console_pump(front));

    // First Ctrl+C stops cleanly at the next suspension point, the second
    // one exits immediately.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, finishing current operations...");
            let _ = cancel_tx.send(true);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second Ctrl+C, exiting immediately");
            std::process::exit(130);
        }
    });

    info!(
        "Starting invite run (mode: {})",
        if repeat { "repeating" } else { "single pass" }
    );
    info!("Settings file: {}", settings_path.display());

    let report = orchestrator
        .run_with_mode(mode, Arc::new(core), cancel_rx)
        .await
        .context("Invite run failed")?;

    let _ = pump.await;
    info!("Run ended with status: {}", report.status);
    Ok(())
}

/// Translates run events to the terminal and prompt replies back.
async fn console_pump(mut front: FrontendHandle) {
    let mut last_line = String::new();
    let mut seen_logs = 0;
    while let Some(event) = front.next_event().await {
        match event {
            RunEvent::Status { report } => {
                for line in report.logs.iter().skip(seen_logs) {
                    info!("{line}");
                }
                seen_logs = report.logs.len();

                let line = format!(
                    "{} | workers {} | accounts {}/{} | processed {} | added {}",
                    report.status,
                    report.tasks_active,
                    report.accounts_used,
                    report.accounts_total,
                    report.users_processed,
                    report.users_added
                );
                if line != last_line {
                    info!("{line}");
                    last_line = line;
                }
            }
            RunEvent::Prompt { prompt } => {
                let input = answer_prompt(&prompt);
                if !front.send(input).await {
                    break;
                }
            }
            RunEvent::InputAck => {}
            RunEvent::Finished { report } => {
                println!("{report}");
            }
        }
    }
}

/// Asks the operator to answer a prompt. Any input failure reads as skip
/// so an unattended run keeps moving.
fn answer_prompt(prompt: &Prompt) -> RunInput {
    match prompt {
        Prompt::LoginCode { account } => {
            println!("Login code requested for {account}");
            let reply: Result<String, _> = Input::new()
                .with_prompt("Enter the login code (empty to resend, 'skip' to give up)")
                .allow_empty(true)
                .interact_text();
            match reply.as_deref() {
                Ok("") => RunInput::Resend,
                Ok("skip") => RunInput::Skip,
                Ok(code) => RunInput::Code(code.trim().to_owned()),
                Err(_) => RunInput::Skip,
            }
        }
        Prompt::SelectGroup { options } => {
            let labels: Vec<String> = options
                .iter()
                .map(|option| match option.member_count {
                    Some(count) => format!("{} ({count} members)", option.title),
                    None => option.title.clone(),
                })
                .collect();
            let picked = Select::new()
                .with_prompt("Choose the target group")
                .items(&labels)
                .default(0)
                .interact();
            match picked {
                Ok(index) => RunInput::GroupSelection(options[index].chat_id),
                Err(_) => RunInput::Skip,
            }
        }
        Prompt::InviteLimit { current, max } => {
            let reply: Result<u32, _> = Input::new()
                .with_prompt(format!(
                    "Invites per account per window (current {current}, max {max})"
                ))
                .interact_text();
            match reply {
                Ok(limit) => RunInput::Limit(limit),
                Err(_) => RunInput::Skip,
            }
        }
    }
}

async fn import_accounts(ledger: &SqliteLedger, file: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let accounts: Vec<NewAccount> =
        serde_json::from_str(&raw).context("Account file is not a JSON array of accounts")?;

    let mut imported = 0;
    for account in accounts {
        let phone = account.phone.clone();
        match ledger.add_account(account).await {
            Ok(_) => imported += 1,
            Err(e) => warn!("Skipping {phone}: {e}"),
        }
    }
    println!("Imported {imported} account(s)");
    Ok(())
}

async fn add_group(ledger: &SqliteLedger, link: &str, target: bool) -> Result<()> {
    let role = if target {
        GroupRole::Target
    } else {
        GroupRole::Source
    };
    let group = ledger
        .add_group(link, None, role)
        .await
        .context("Failed to add group")?;
    println!("Added {} group #{}: {}", group.role, group.id, group.link);
    Ok(())
}

async fn list_accounts(ledger: &SqliteLedger) -> Result<()> {
    let accounts = ledger.list_accounts().await?;
    if accounts.is_empty() {
        println!("No accounts stored. Use import-accounts to add some.");
        return Ok(());
    }
    println!("{:>4}  {:<16} {:<20} {:>6}  status", "id", "phone", "name", "quota");
    for account in accounts {
        println!(
            "{:>4}  {:<16} {:<20} {:>6}  {}",
            account.id,
            account.phone,
            account.name,
            account.invites_remaining,
            account_status(&account)
        );
    }
    Ok(())
}

fn account_status(account: &Account) -> String {
    let state = if account.deactivated {
        "deactivated"
    } else if !account.authenticated {
        "unauthenticated"
    } else {
        "ok"
    };
    match &account.details {
        Some(details) => format!("{state} ({details})"),
        None => state.to_owned(),
    }
}

async fn list_groups(ledger: &SqliteLedger) -> Result<()> {
    let groups = ledger.list_groups().await?;
    if groups.is_empty() {
        println!("No groups stored. Use add-group to add some.");
        return Ok(());
    }
    println!("{:>4}  {:<6} {:<8} {:>8}  group", "id", "role", "state", "members");
    for group in groups {
        println!(
            "{:>4}  {:<6} {:<8} {:>8}  {}",
            group.id,
            group.role,
            if group.enabled { "enabled" } else { "disabled" },
            group.member_count,
            group_label(&group)
        );
    }
    Ok(())
}

fn group_label(group: &Group) -> String {
    let name = group.display_name();
    match &group.details {
        Some(details) => format!("{name} [{details}]"),
        None => name.to_owned(),
    }
}

async fn choose_target(settings: Settings, config: AppConfig, ledger: SqliteLedger) -> Result<()> {
    let accounts = ledger.list_accounts().await?;
    let account = accounts
        .iter()
        .find(|account| account.is_usable() && account.session_blob.is_some())
        .context("No authorized account with a stored session; run `run` once first")?;

    let connector = connector(&settings, &config);
    let session = connector
        .connect(account)
        .await
        .with_context(|| format!("Failed to connect {}", account.phone))?;
    if !session
        .is_authorized()
        .await
        .context("Failed to check authorization")?
    {
        anyhow::bail!("Account {} has no valid session; run `run` once first", account.phone);
    }

    let (core, front) = frontend::link();
    let pump = tokio::spawn(console_pump(front));
    let chosen = frontend::choose_target_group(&core, session.as_ref(), &ledger)
        .await
        .context("Target selection failed")?;

    if let Ok(Some(blob)) = session.disconnect(true).await {
        ledger.save_session(account.id, &blob).await?;
    }
    drop(core);
    let _ = pump.await;

    match chosen {
        Some(group) => println!("Target group is now: {}", group.display_name()),
        None => println!("Target group unchanged"),
    }
    Ok(())
}

async fn set_limit(settings_path: &PathBuf, mut settings: Settings) -> Result<()> {
    let (core, front) = frontend::link();
    let pump = tokio::spawn(console_pump(front));
    let changed = frontend::adjust_invite_limit(&core, &mut settings, settings_path)
        .await
        .context("Failed to update the invite limit")?;
    drop(core);
    let _ = pump.await;

    if changed {
        println!("Invite limit is now {}", settings.invite_limit);
    } else {
        println!("Invite limit unchanged ({})", settings.invite_limit);
    }
    Ok(())
}
