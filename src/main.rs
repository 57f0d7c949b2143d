//! vmpilot - manage Multipass VMs through a conversational interface

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use vmpilot::agent::{IntentResolver, Orchestrator, SessionRegistry};
use vmpilot::config::Config;
use vmpilot::dashboard::{self, DashboardState};
use vmpilot::events::{OperationOutcome, StreamEvent};
use vmpilot::ollama::OllamaClient;
use vmpilot::tracing::{init_tracing, shutdown_tracing};
use vmpilot::vm::{BackendExecutor, InventoryCache, MultipassBackend, VmRecord};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "vmpilot", version, about = "Natural-language control of local Multipass VMs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the status panel and chat API
    Serve {
        /// Listen address (overrides LISTEN_ADDR / PROXY_SERVER_PORT)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Interactive chat on stdin; Ctrl-C cancels the running turn
    Chat {
        #[arg(long, default_value = "cli")]
        session: String,
    },
    /// Print the VM inventory
    Vms {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing("vmpilot", config.otlp_endpoint.as_deref(), config.log_format)?;

    let orchestrator = build_orchestrator(&config);
    let result = match cli.command {
        Command::Serve { listen } => {
            serve(orchestrator, &config, listen.unwrap_or(config.listen_addr)).await
        }
        Command::Chat { session } => chat(orchestrator, &session).await,
        Command::Vms { json } => print_vms(orchestrator, json).await,
    };

    shutdown_tracing();
    result
}

fn build_orchestrator(config: &Config) -> Orchestrator {
    let backend = Arc::new(MultipassBackend::new(config.multipass_bin.clone()));
    let executor = BackendExecutor::new(backend)
        .with_timeouts(config.exec_timeout, config.launch_timeout);
    let inventory = InventoryCache::new(executor.clone());

    let model = Arc::new(OllamaClient::new(&config.ollama_url, &config.ollama_model));
    let mut resolver = IntentResolver::new(model)
        .with_limits(config.limits.clone())
        .with_timeout(config.request_timeout);
    if let Some(prompt) = &config.system_prompt {
        resolver = resolver.with_system_prompt(prompt.clone());
    }

    Orchestrator::new(resolver, executor, inventory).with_history_limit(config.history_limit)
}

async fn serve(orchestrator: Orchestrator, config: &Config, listen: SocketAddr) -> Result<(), BoxError> {
    if let Err(e) = orchestrator.refresh_inventory().await {
        warn!(error = %e, "initial inventory refresh failed");
    }
    let refresher = InventoryCache::start_refresher(orchestrator.inventory().clone(), config.refresh_interval);

    let state = DashboardState {
        registry: Arc::new(SessionRegistry::new(orchestrator)),
    };
    let outcome = tokio::select! {
        res = dashboard::serve(state, listen) => res.map_err(BoxError::from),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    };
    refresher.abort();
    outcome
}

async fn chat(orchestrator: Orchestrator, session_id: &str) -> Result<(), BoxError> {
    if let Err(e) = orchestrator.refresh_inventory().await {
        warn!(error = %e, "inventory refresh failed");
    }
    let session = orchestrator.open_session(session_id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        if matches!(line.trim(), "exit" | "quit") {
            break;
        }

        let mut events = match session.send_user_turn(&line) {
            Ok(events) => events,
            Err(e) => {
                println!("error: {}", e);
                continue;
            }
        };
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        let done = matches!(event, StreamEvent::Done { .. });
                        print_event(&event);
                        if done {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    session.cancel();
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: &StreamEvent) {
    match event {
        StreamEvent::TextChunk(text) => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        StreamEvent::OperationStarted(op) => {
            println!("\n[{}] {}", op.kind(), op.vm_name().unwrap_or(""));
        }
        StreamEvent::OperationProgress { message, .. } => println!("  {}", message),
        StreamEvent::OperationResult(OperationOutcome::Inventory(records)) => print_table(records),
        StreamEvent::OperationResult(OperationOutcome::Vm(record)) => {
            println!("✅ {} is {:?}", record.name, record.status);
        }
        StreamEvent::OperationResult(OperationOutcome::Removed(record)) => {
            println!("✅ {} deleted", record.name);
        }
        StreamEvent::OperationError(failure) => println!("❌ {}", failure),
        StreamEvent::Done { status } => println!("\n({})", status.as_str()),
    }
}

async fn print_vms(orchestrator: Orchestrator, json: bool) -> Result<(), BoxError> {
    let records = orchestrator.refresh_inventory().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_table(&records);
    }
    Ok(())
}

fn print_table(records: &[VmRecord]) {
    if records.is_empty() {
        println!("No VMs.");
        return;
    }
    println!(
        "{:<24} {:<13} {:<16} {:>4} {:>9} {:>6}",
        "NAME", "STATUS", "IPV4", "CPUS", "MEMORY", "DISK"
    );
    for r in records {
        println!(
            "{:<24} {:<13} {:<16} {:>4} {:>7}MB {:>4}GB",
            r.name,
            format!("{:?}", r.status),
            r.ip_address.as_deref().unwrap_or("-"),
            r.cpus,
            r.memory_mb,
            r.disk_gb
        );
    }
}
