//! quest-sandbox CLI entry point.
//!
//! `run` executes a bundle directory with the component runtime against an
//! in-process host; `link` shows what the module linker mints for it.

mod bundle;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quest_sandbox_common::Capability;
use quest_sandbox_common::config_file::{AiConfig, ConfigFile};
use quest_sandbox_common::protocol::{Endpoint, channel};
use quest_sandbox_core::bridge::Incoming;
use quest_sandbox_core::link::LinkInput;
use quest_sandbox_core::{Bridge, HostEvent, LifecycleController, ModuleLinker, ModuleStore};
use quest_sandbox_host::{
    AiForwarder, CapabilityRegistry, GuestLog, Permissions, QuestBook, SandboxHost,
    new_instance_id,
};
use quest_sandbox_runtime::{ComponentLoader, WasmEngine};

#[derive(Debug, Parser)]
#[command(name = "quest-sandbox", version, about = "Run quest agents in a sandbox")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "QUEST_SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a bundle and print its result and quest book.
    Run {
        /// Bundle directory.
        dir: PathBuf,

        /// Navigate to URL after execution (repeatable).
        #[arg(long = "navigate", value_name = "URL")]
        navigations: Vec<String>,

        /// Code passed to `run`/`runCode`; overrides args.json.
        #[arg(long)]
        code: Option<String>,

        /// Agent instance id (default: random).
        #[arg(long)]
        instance_id: Option<String>,
    },

    /// Link a bundle and print the minted modules.
    Link {
        /// Bundle directory.
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConfigFile::default(),
    };

    match cli.command {
        Command::Run {
            dir,
            navigations,
            code,
            instance_id,
        } => run(&config, &dir, &navigations, code, instance_id).await,
        Command::Link { dir } => link(&config, &dir).map(|()| ExitCode::SUCCESS),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,quest_sandbox=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(
    config: &ConfigFile,
    dir: &Path,
    navigations: &[String],
    code: Option<String>,
    instance_id: Option<String>,
) -> anyhow::Result<ExitCode> {
    let instance_id = instance_id.unwrap_or_else(new_instance_id);
    let mut bundle = bundle::load(dir, &instance_id)?;
    if let Some(code) = code {
        bundle::set_code(&mut bundle, code);
    }

    let book = Arc::new(QuestBook::new(config.host.start_url.clone()));
    let log = Arc::new(GuestLog::new());
    let (permissions, ai) = ai_forwarder(&config.host.ai)?;
    let registry = Arc::new(CapabilityRegistry::with_defaults(
        permissions,
        book.clone(),
        log.clone(),
        ai,
    ));
    info!(capabilities = ?registry.wire_types(), "Host capabilities registered");

    let engine = WasmEngine::new(&config.runtime.engine)?;
    let ticker = engine.spawn_epoch_ticker();
    let loader = Arc::new(ComponentLoader::new(
        engine,
        config.runtime.execution.clone(),
    )?);

    // The handle owns the only strong sender towards the sandbox side, so
    // it is kept until every lifecycle call has finished.
    let (host_end, Endpoint { tx, mut rx }) = channel();
    let (host, handle) = SandboxHost::new(registry, host_end);
    let host_task = tokio::spawn(host.run());

    let bridge = Arc::new(Bridge::new(tx));
    let pump = tokio::spawn({
        let bridge = bridge.clone();
        async move {
            while let Some(message) = rx.recv().await {
                if let Incoming::Execute(_) | Incoming::InvalidExecute(_) | Incoming::Navigate(_) =
                    bridge.handle_incoming(message)
                {
                    warn!("Ignoring host command sent to the CLI sandbox");
                }
            }
        }
    });

    let mut controller = LifecycleController::new(config.runtime.sandbox.clone(), bridge, loader);
    let result = controller.execute_bundle(bundle).await;
    println!("{result}");

    for url in navigations {
        book.set_current_url(url);
        match controller
            .dispatch_event(HostEvent::Navigate { url: url.clone() })
            .await
        {
            Ok(true) => info!(url = %url, "Navigation delivered"),
            Ok(false) => info!(url = %url, "Navigation not handled by the agent"),
            Err(e) => warn!(url = %url, error = %e, "onVisit failed"),
        }
    }

    controller.shutdown();
    drop(controller);
    drop(handle);
    pump.await.context("Response pump panicked")?;
    host_task.await.context("Host task panicked")?;
    if let Some(ticker) = ticker {
        ticker.abort();
    }

    print_quest_book(&book);
    Ok(if result.starts_with("Error:") {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn ai_forwarder(ai: &AiConfig) -> anyhow::Result<(Permissions, Option<Arc<AiForwarder>>)> {
    let Some(endpoint) = ai.endpoint.as_deref().filter(|_| ai.is_configured()) else {
        if ai.endpoint.is_some() {
            warn!("AI endpoint set without allowed_hosts; ai.ask disabled");
        }
        return Ok((Permissions::quest_defaults(), None));
    };

    let permissions = Permissions::builder()
        .allow_capabilities(Capability::ALL)
        .allow_ai_hosts(ai.allowed_hosts.iter().cloned())
        .max_ai_requests(ai.max_requests)
        .build();
    let forwarder = AiForwarder::new(
        endpoint,
        permissions.clone(),
        Duration::from_secs(ai.timeout_secs),
    )
    .context("Failed to create AI forwarder")?;

    info!(endpoint, "ai.ask forwarding enabled");
    Ok((permissions, Some(Arc::new(forwarder))))
}

fn print_quest_book(book: &QuestBook) {
    let tasks = book.tasks();
    let items = book.items();
    let notifications = book.notifications();

    if !tasks.is_empty() {
        println!("\nTasks:");
        for task in tasks {
            println!(
                "  [{}] {}/{}: {}",
                task.status, task.quest_id, task.task_id, task.description
            );
        }
    }
    if !items.is_empty() {
        println!("\nItems:");
        for item in items {
            println!("  {} ({}) {} <{}>", item.id, item.kind, item.title, item.url);
        }
    }
    if !notifications.is_empty() {
        println!("\nNotifications:");
        for notification in notifications {
            println!("  {}", notification.message);
        }
    }
}

fn link(config: &ConfigFile, dir: &Path) -> anyhow::Result<()> {
    let bundle = bundle::load(dir, "link")?;
    let store = ModuleStore::new(config.runtime.sandbox.blob_origin.clone());
    let output = ModuleLinker::new()
        .link(&store, LinkInput::from(&bundle))
        .map_err(|e| anyhow::anyhow!(e.to_result()))?;

    println!("main    {}", output.main.url());
    println!("bridge  {}", output.bridge.url());
    for (name, handle) in &output.shims {
        println!("shim    {name} {}", handle.url());
    }
    for (name, handle) in &output.wasm {
        println!("wasm    {name} {}", handle.url());
    }
    for (specifier, adapter) in &output.adapters {
        let url = adapter
            .handle
            .as_ref()
            .map_or_else(String::new, |h| h.url().to_string());
        println!("adapter {specifier} {url}");
        println!("{}", adapter.source);
    }
    println!("\n{}", output.main_source);

    Ok(())
}
