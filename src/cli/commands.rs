//! CLI command execution.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::agents::{Pathway, ProcessOptions};
use crate::api::{self, AppState};
use crate::batch::{BatchOptions, BatchProgress};
use crate::config::Config;
use crate::domain::{CategorizedReceipt, ExpenseOpsError, Result};
use crate::observability::init_tracing;
use crate::services::Services;

use super::{BatchArgs, Cli, Commands, OutputFormat, UploadArgs};

/// Run the CLI to completion and return the process exit code.
pub async fn execute(cli: Cli) -> i32 {
    let mut config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            return e.exit_code();
        }
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if let Err(e) = init_tracing(&config.logging) {
        debug!("tracing already initialized: {}", e);
    }

    let services = match Services::from_config(config) {
        Ok(services) => services,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            return e.exit_code();
        }
    };

    let result = dispatch(&services, cli.command).await;

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            e.exit_code()
        }
    };

    services.shutdown().await;
    code
}

async fn dispatch(services: &Services, command: Commands) -> Result<i32> {
    match command {
        Commands::Auth { force } => run_auth(services, force).await,
        Commands::Status => run_status(services).await,
        Commands::Upload(args) => run_upload(services, args).await,
        Commands::Batch(args) => run_batch(services, args).await,
        Commands::Serve { bind, port } => run_serve(services, bind, port).await,
    }
}

async fn run_auth(services: &Services, force: bool) -> Result<i32> {
    if force {
        services.oauth.reset()?;
    } else if services.oauth.status()?.authorized {
        println!(
            "{} already authorized; use --force to re-authorize",
            style("ok:").green().bold()
        );
        return Ok(0);
    }

    let state = Uuid::new_v4().to_string();
    let url = services.oauth.authorize_url(&state)?;
    println!("Open this URL in your browser and authorize access:\n\n  {}\n", url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Paste the 'code' parameter from the redirect URL:");
    let code = read_required_line(&mut lines).await?;
    println!("Paste the 'realmId' parameter from the redirect URL:");
    let realm_id = read_required_line(&mut lines).await?;

    services.oauth.exchange_code(&code, &realm_id).await?;
    println!("{} tokens saved", style("ok:").green().bold());
    Ok(0)
}

async fn read_required_line(
    lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> Result<String> {
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| ExpenseOpsError::invalid_input("unexpected end of input"))?;
    let trimmed = line.trim().to_string();
    if trimmed.is_empty() {
        return Err(ExpenseOpsError::invalid_input("empty value"));
    }
    Ok(trimmed)
}

async fn run_status(services: &Services) -> Result<i32> {
    let status = services.oauth.status()?;
    if !status.authorized {
        return Err(ExpenseOpsError::AuthExpired(
            "not authorized; run `expense-ops auth`".to_string(),
        ));
    }

    println!(
        "access token:  {}",
        if status.access_token_valid {
            style("valid").green()
        } else {
            style("stale (will refresh on next call)").yellow()
        }
    );
    println!(
        "refresh token: {}",
        if status.refresh_token_valid {
            style("valid").green()
        } else {
            style("expired").red()
        }
    );
    if let Some(company_id) = &status.company_id {
        println!("company:       {}", company_id);
    }

    match services.quickbooks.probe().await {
        Ok(()) => println!("connectivity:  {}", style("ok").green()),
        Err(e) => {
            println!("connectivity:  {}", style("failed").red());
            return Err(e);
        }
    }
    Ok(0)
}

async fn run_upload(services: &Services, args: UploadArgs) -> Result<i32> {
    let content = tokio::fs::read(&args.file).await.map_err(|e| {
        ExpenseOpsError::invalid_input(format!("{}: {}", args.file.display(), e))
    })?;

    let cancel = CancellationToken::new();
    spawn_interrupt_watcher(cancel.clone());

    let result = services
        .orchestrator
        .process(
            content,
            ProcessOptions {
                pathway: if args.rules { Pathway::Rules } else { Pathway::Agents },
                dry_run: args.dry_run,
                context: args.context,
                correlation_id: None,
                cancel,
            },
        )
        .await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => render_text(&result),
    }
    Ok(0)
}

fn render_text(receipt: &CategorizedReceipt) {
    println!(
        "{} {} — {}",
        style("receipt:").bold(),
        receipt.receipt.vendor_name,
        receipt.receipt.transaction_date
    );
    for item in &receipt.items {
        println!(
            "  {:>2}. {:<40} {:<28} {:>3}%  {:>10}",
            item.line_number,
            truncate(&item.description, 40),
            item.category.to_string(),
            item.deductibility_percent,
            item.deductible_amount
        );
    }
    println!(
        "{} {} of {} ({}%)",
        style("deductible:").bold(),
        receipt.total_deductible,
        receipt.total_original,
        receipt.deductibility_rate
    );
    println!(
        "{} {:.2}",
        style("confidence:").bold(),
        receipt.overall_confidence
    );
    if !receipt.flags_for_review.is_empty() {
        println!("{}", style("review required:").yellow().bold());
        for flag in &receipt.flags_for_review {
            println!("  - {}", flag);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", truncated)
    }
}

async fn run_batch(services: &Services, args: BatchArgs) -> Result<i32> {
    let cancel = CancellationToken::new();
    spawn_interrupt_watcher(cancel.clone());

    let (progress_tx, mut progress_rx) = mpsc::channel::<BatchProgress>(64);
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
            .expect("progress template"),
    );
    let bar_task = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                bar.set_length(progress.total as u64);
                bar.set_position(progress.current as u64);
                if let Some(eta) = progress.eta {
                    bar.set_message(format!("eta {:?}", eta));
                }
            }
        })
    };

    let driver = services.batch_driver();
    let outcome = driver
        .run(
            &args.dir,
            BatchOptions {
                recursive: args.recursive,
                pattern: args.pattern,
                dry_run: args.dry_run,
                parallel: args.parallel,
                resume_id: args.resume,
                continue_on_error: !args.fail_fast,
                pathway: if args.rules { Pathway::Rules } else { Pathway::Agents },
            },
            Some(progress_tx),
            cancel,
        )
        .await?;

    let _ = bar_task.await;
    bar.finish_and_clear();

    println!(
        "{} {} processed, {} skipped, {} failed",
        style("batch:").bold(),
        outcome.processed,
        outcome.skipped,
        outcome.failed.len()
    );
    for (path, error) in &outcome.failed {
        println!("  {} {}: {}", style("failed").red(), path.display(), error);
    }

    if outcome.canceled {
        println!(
            "{} interrupted; resume with: expense-ops batch {} --resume {}",
            style("note:").yellow().bold(),
            args.dir.display(),
            outcome.batch_id
        );
        return Ok(130);
    }
    Ok(0)
}

async fn run_serve(
    services: &Services,
    bind: Option<String>,
    port: Option<u16>,
) -> Result<i32> {
    let http = services.config.http.clone().unwrap_or_default();
    let bind = bind.unwrap_or(http.bind);
    let port = port.unwrap_or(http.port);

    let state = AppState {
        orchestrator: services.orchestrator.clone(),
        oauth: services.oauth.clone(),
    };
    api::serve(state, &bind, port).await?;
    Ok(0)
}

fn spawn_interrupt_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}
