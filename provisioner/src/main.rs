//! sentinel-provisioner - Sentinel Agent host provisioner
//!
//! Usage:
//!   sentinel-provisioner install ...    # install from a local bundle (or --skip-build)
//!   sentinel-provisioner bootstrap ...  # ensure runtime, fetch bundle, then install

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use sentinel_provisioner::{BootstrapOptions, InstallOptions};

#[derive(Parser)]
#[command(name = "sentinel-provisioner")]
#[command(about = "Install Sentinel Agent as a managed background service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the install pipeline on this host
    Install(InstallArgs),

    /// Ensure the managed runtime, download the source bundle, then install from it
    Bootstrap(BootstrapArgs),
}

#[derive(Args, Clone)]
struct InstallArgs {
    /// OS service name
    #[arg(long, default_value = "sentinel-agent")]
    service_name: String,

    /// Install root (defaults to the platform location)
    #[arg(long)]
    install_path: Option<PathBuf>,

    /// Display name shown by the service manager and on firewall rules
    #[arg(long, default_value = "Sentinel Agent")]
    display_name: String,

    #[arg(long, default_value = "Sentinel monitoring agent")]
    description: String,

    /// Listening port (ignored when an existing configuration file sets one)
    #[arg(long, default_value_t = 3000)]
    port: u16,

    #[arg(long, default_value_t = 3001)]
    secondary_port: u16,

    /// Do not build the updater
    #[arg(long)]
    skip_build: bool,

    /// Service wrapper version (Windows)
    #[arg(long)]
    wrapper_version: Option<String>,

    /// Source bundle root holding installer/install.toml
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// API key written on first install (prompted for otherwise)
    #[arg(long, conflicts_with = "non_interactive")]
    api_key: Option<String>,

    /// Never prompt; generate the API key when none is given
    #[arg(long)]
    non_interactive: bool,

    /// Provisioner configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct BootstrapArgs {
    #[command(flatten)]
    install: InstallArgs,

    /// Source bundle archive URL (defaults to the configured one)
    #[arg(long)]
    bundle_url: Option<String>,

    /// Leave the extracted bundle in place after the run
    #[arg(long)]
    keep_work_dir: bool,
}

impl From<InstallArgs> for InstallOptions {
    fn from(a: InstallArgs) -> Self {
        InstallOptions {
            service_name: a.service_name,
            install_path: a.install_path,
            display_name: a.display_name,
            description: a.description,
            port: a.port,
            secondary_port: a.secondary_port,
            skip_build: a.skip_build,
            wrapper_version: a.wrapper_version,
            source_dir: a.source_dir,
            api_key: a.api_key,
            non_interactive: a.non_interactive,
            config: a.config,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = sentinel_provisioner::init_logging(true) {
        eprintln!("Warning: logging disabled: {}", e);
    }

    let code = match cli.command {
        Commands::Install(args) => sentinel_provisioner::run_install(args.into()).await,
        Commands::Bootstrap(args) => {
            sentinel_provisioner::run_bootstrap(BootstrapOptions {
                install: args.install.into(),
                bundle_url: args.bundle_url,
                keep_work_dir: args.keep_work_dir,
            })
            .await
        }
    };
    ExitCode::from(code as u8)
}
