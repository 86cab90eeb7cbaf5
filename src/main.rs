use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use backer::{
    api,
    config::Config,
    engine::Engine,
    registry::Registry,
    tooling::Toolbox,
    ui,
    utils::{
        lock::InstanceLock,
        process::{ProcessRunner, Runner},
    },
    volume::Volume,
};

#[derive(Parser, Debug)]
#[command(
    name = "backer",
    about = "Docker volume plugin with scheduled restic backups and restore-on-mount",
    arg_required_else_help = false,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[arg(long, default_value = "/etc/backer/config.toml", global = true)]
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the volume driver daemon on its Unix socket.
    Serve,
    /// Print the registered volumes and their backup state.
    Volumes,
}

fn init_tracing(debug: bool) {
    let default = if debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.command.is_none() && !cli.check_config && !cli.print_config {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    }
    let cfg = Config::load_or_default(&cli.config)?;

    if cli.check_config {
        tracing::info!("config OK");
        return Ok(());
    }
    if cli.print_config {
        println!("{}", cfg.to_toml()?);
        return Ok(());
    }

    let Some(cmd) = cli.command else {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    };

    match cmd {
        Cmd::Serve => serve(cfg),
        Cmd::Volumes => volumes(&cfg),
    }
}

fn serve(cfg: Config) -> Result<()> {
    let _lock = InstanceLock::try_acquire(&cfg.paths.lockfile())?;

    let runner: Arc<dyn Runner + Send + Sync> = Arc::new(ProcessRunner::new());
    let tools = Toolbox::new(runner)?;
    let socket = cfg.paths.socket.clone();
    let engine = Engine::new(cfg, tools);
    engine.start()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(api::serve(engine, &socket))
}

fn volumes(cfg: &Config) -> Result<()> {
    let registry = Registry::load(&cfg.paths.registry_file());
    let vols: Vec<Volume> = registry.volumes().cloned().collect();
    ui::log_volumes(&vols);
    Ok(())
}
