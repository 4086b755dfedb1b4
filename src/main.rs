use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

mod cli;

use cli::Cli;
use cli::commands::{Commands, TaskCommands};
use fundlink::config::Config;
use fundlink::messaging::{MessagingSession, Params, ResponseEnvelope};

fn setup_logging(level: &str) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fundlink")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("fundlink.log");

    // Setup env_logger with file output; RUST_LOG wins over config
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
        println!("  REQ endpoint: {}", config.backend.req_endpoint());
        println!("  SUB endpoint: {}", config.backend.pub_endpoint());
    }

    let session = MessagingSession::from_config(config);
    if let Commands::Listen { topics, .. } = &cli.command {
        for topic in topics {
            session.subscribe(topic).await;
        }
    }

    session
        .connect_configured(config)
        .await
        .context("Failed to connect to backend")?;

    let result = match &cli.command {
        Commands::Ping => handle_ping_command(&session).await,
        Commands::Request {
            action,
            params,
            timeout_ms,
        } => handle_request_command(&session, action, params.as_deref(), *timeout_ms).await,
        Commands::Tasks { command } => handle_tasks_command(&session, command).await,
        Commands::Login { username, password } => handle_login_command(&session, username, password).await,
        Commands::Listen { count, .. } => handle_listen_command(&session, *count).await,
    };

    session.disconnect().await;
    result
}

async fn handle_ping_command(session: &MessagingSession) -> Result<()> {
    let started = std::time::Instant::now();
    let ok = session.ping().await.context("Ping failed")?;
    let elapsed = started.elapsed();
    if ok {
        println!("{} backend answered in {} ms", "Pong:".green(), elapsed.as_millis());
    } else {
        println!("{} backend replied with an error", "Ping:".red());
    }
    Ok(())
}

async fn handle_request_command(
    session: &MessagingSession,
    action: &str,
    params: Option<&str>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let params: Params = match params {
        Some(raw) => serde_json::from_str(raw).context("Params must be a JSON object")?,
        None => Params::new(),
    };
    info!("Sending {} with {} params", action, params.len());

    let response = session
        .request_with_timeout(action, params, timeout_ms.map(Duration::from_millis))
        .await
        .context(format!("Request {} failed", action))?;
    print_response(&response)
}

fn print_response(response: &ResponseEnvelope) -> Result<()> {
    match response.error_message() {
        None => println!("{}", "OK".green()),
        Some(message) => println!("{} {}", "Error:".red(), message),
    }
    println!("{}", serde_json::to_string_pretty(&response.data)?);
    Ok(())
}

async fn handle_tasks_command(session: &MessagingSession, command: &TaskCommands) -> Result<()> {
    match command {
        TaskCommands::List => {
            let tasks = session.list_tasks().await.context("Failed to list tasks")?;
            println!("{} {} task(s)", "Tasks:".cyan(), tasks.len());
            for task in tasks {
                println!("  {}  {}", task.task_id.bold(), task.task_name);
            }
        }
        TaskCommands::Create { name } => {
            let task = session.create_task(name).await.context("Failed to create task")?;
            println!("{} {} ({})", "Created:".green(), task.task_name, task.task_id);
        }
    }
    Ok(())
}

async fn handle_login_command(session: &MessagingSession, username: &str, password: &str) -> Result<()> {
    let auth = session.login(username, password).await.context("Login failed")?;
    println!("{} {} ({})", "Logged in:".green(), auth.username, auth.role);
    if !auth.permissions.is_empty() {
        println!("  Permissions: {}", auth.permissions.join(", "));
    }

    session
        .verify_session(&auth.session_token)
        .await
        .context("Session verification failed")?;
    println!("{} session token is valid", "Verified:".green());
    Ok(())
}

async fn handle_listen_command(session: &MessagingSession, count: Option<usize>) -> Result<()> {
    let topics = session.topics().await;
    if topics.is_empty() {
        println!("{}", "Listening for all notifications...".cyan());
    } else {
        println!(
            "{} {}",
            "Listening on:".cyan(),
            topics.iter().collect::<Vec<_>>().join(", ")
        );
    }

    let mut received = 0;
    while count.is_none_or(|limit| received < limit) {
        let notification = tokio::select! {
            n = session.recv_notification() => match n {
                Some(n) => n,
                None => {
                    println!("{}", "Session disconnected".yellow());
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        received += 1;

        match notification.progress() {
            Some(progress) => println!(
                "{} {}/{} ({:.0}%) {}",
                "progress".yellow(),
                progress.current,
                progress.total,
                progress.ratio() * 100.0,
                progress.message
            ),
            None => {
                let topic = notification.topic.as_deref().unwrap_or("-");
                println!(
                    "{} [{}] {}",
                    notification.kind.yellow(),
                    topic,
                    serde_json::to_string(&notification.data)?
                );
            }
        }
    }

    info!("Listener received {} notification(s)", received);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration, then env and flag overrides
    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.apply_env().context("Invalid environment override")?;
    cli.apply_overrides(&mut config);

    setup_logging(config.log_level.as_deref().unwrap_or("info")).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
