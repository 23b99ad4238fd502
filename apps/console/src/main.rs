use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{SessionController, SessionEvent};
use shared::protocol::JobConfig;
use tokio::sync::broadcast::error::RecvError;

mod config;

#[derive(Parser, Debug)]
#[command(about = "Operator console for the crawler backend")]
struct Cli {
    /// Control-plane base url; overrides console.toml and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the crawler's current status.
    Status,
    /// Start a crawl with the given configuration.
    Start {
        #[arg(long)]
        platform: String,
        #[arg(long, default_value = "search")]
        crawler_type: String,
        #[arg(long, default_value = "")]
        keywords: String,
        #[arg(long, default_value = "")]
        specified_ids: String,
        #[arg(long, default_value = "")]
        creator_ids: String,
        #[arg(long, default_value = "qrcode")]
        login_type: String,
        #[arg(long, default_value = "")]
        cookies: String,
        #[arg(long, default_value_t = 1)]
        start_page: u32,
        #[arg(long, default_value = "json")]
        save_option: String,
        #[arg(long)]
        enable_comments: bool,
        #[arg(long)]
        headed: bool,
    },
    /// Ask the backend to stop the running crawl.
    Stop,
    /// Follow live status and log output until interrupted.
    Tail,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();

    let mut settings = config::load_settings();
    if let Some(url) = cli.server_url {
        settings.server_url = url;
    }
    let server_url = config::normalize_server_url(&settings.server_url);

    let controller = SessionController::new(&server_url)?;

    match cli.command {
        Command::Status => {
            controller.bootstrap().await;
            println!("status: {}", controller.current_status());
        }
        Command::Start {
            platform,
            crawler_type,
            keywords,
            specified_ids,
            creator_ids,
            login_type,
            cookies,
            start_page,
            save_option,
            enable_comments,
            headed,
        } => {
            let config = JobConfig {
                platform,
                crawler_type,
                keywords,
                specified_ids,
                creator_ids,
                login_type,
                cookies,
                start_page,
                save_option,
                enable_comments,
                headless: !headed,
                ..JobConfig::default()
            };
            controller.start_job(&config).await?;
            println!("crawl start accepted");
        }
        Command::Stop => {
            controller.stop_job().await?;
            println!("crawl stop requested");
        }
        Command::Tail => {
            tail(&controller, Duration::from_millis(settings.poll_interval_ms)).await;
        }
    }

    Ok(())
}

async fn tail(controller: &Arc<SessionController>, poll_interval: Duration) {
    controller.bootstrap().await;
    for entry in controller.log_buffer() {
        print_log(&entry);
    }
    println!("status: {}", controller.current_status());

    let mut events = controller.subscribe_events();
    controller.connect_stream();
    controller.start_polling(poll_interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                controller.stream().disconnect();
                controller.stop_polling();
                return;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Log(entry)) => print_log(&entry),
                Ok(SessionEvent::Status(status)) => println!("status -> {status}"),
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("(skipped {skipped} events)");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}

fn print_log(entry: &shared::protocol::LogEntry) {
    println!(
        "{} [{:>7}] {}",
        entry.timestamp,
        entry.level.as_str(),
        entry.message
    );
}
