#[macro_use]
extern crate tracing;

use std::path::PathBuf;

use clap::Parser;

use nexus::{
    core::{Nexus, NexusArgs},
    logger,
    logger::LogFormat,
    subsys::watcher,
};

#[derive(Debug, Parser)]
#[command(name = "nexus", version, about = "Streaming pipeline supervisor")]
enum Cli {
    /// Start the supervisor for a pipeline document.
    Serve(ServeArgs),
    /// Internal: hosts the watcher actor; spawned by `serve`.
    #[command(hide = true)]
    Watcher(WatcherArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Pipeline document (YAML).
    #[arg(short = 'c', long)]
    config: PathBuf,
    /// Control socket port; 0 auto-allocates, file settings win over 0.
    #[arg(long, default_value_t = 0)]
    control_port: u16,
    /// Output socket port; 0 auto-allocates, file settings win over 0.
    #[arg(long, default_value_t = 0)]
    output_port: u16,
    /// Store byte budget; the file setting wins when present.
    #[arg(short = 's', long)]
    store_size: Option<u64>,
    /// Log level when RUST_LOG is not set.
    #[arg(short = 'l', long, default_value = "INFO")]
    log_level: String,
    /// Formatting of the logs: 'compact', 'color', 'nocolor', 'nodate'.
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[derive(Debug, Parser)]
struct WatcherArgs {
    /// JSON spawn spec handed down by the supervisor.
    #[arg(long)]
    spec: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse() {
        Cli::Serve(args) => serve(args),
        Cli::Watcher(args) => watch(args),
    }
}

fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    logger::init_ex(&args.log_level, args.log_format.unwrap_or_default());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let mut nexus = Nexus::start(NexusArgs {
            config: args.config,
            control_port: args.control_port,
            output_port: args.output_port,
            store_size: args.store_size,
        })
        .await?;

        // the line a front end parses to find its sockets
        println!(
            "control_port={} output_port={}",
            nexus.control_port(),
            nexus.output_port()
        );

        nexus.run().await
    })?;

    info!("Nexus exited cleanly");
    Ok(())
}

fn watch(args: WatcherArgs) -> Result<(), Box<dyn std::error::Error>> {
    logger::init("INFO");
    let registry = watcher::registry();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let code = rt.block_on(actor_api::run_with_spec(&registry, &args.spec));
    std::process::exit(code);
}
