//! Pulse Tunnel - CLI Entry Point
//!
//! `pulse-tunnel connect` keeps a tunnel and the control API up until Ctrl+C.
//! The other subcommands are one-shot helpers around link parsing, document
//! synthesis and geo data.

// Use mimalloc as global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use pulse_tunnel::config::builder::{document_for_link, normalize, write_document};
use pulse_tunnel::config::{parse_subscription, ConfigDocument};
use pulse_tunnel::platform::HostResolver;
use pulse_tunnel::rule::{geo, strip_geoip, RoutingPolicy};
use pulse_tunnel::tunnel::TunnelSource;
use pulse_tunnel::{dns, engine_adapter, Client, Config, VERSION};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pulse-tunnel")]
#[command(version = VERSION)]
#[command(about = "Proxy-link VPN client core")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Configuration directory
    #[arg(short = 'd', long = "directory", global = true)]
    directory: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tunnel and control API until interrupted
    #[command(visible_alias = "run")]
    Connect {
        /// Connect to this link on startup
        #[arg(long)]
        link: Option<String>,

        /// Connect with the saved profile on startup
        #[arg(long, conflicts_with = "link")]
        saved: bool,

        /// Control API address (overrides config)
        #[arg(long = "ext-ctl")]
        external_controller: Option<String>,

        /// Control API secret (overrides config)
        #[arg(long)]
        secret: Option<String>,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Parse a link or subscription blob and print its servers
    Parse {
        link: String,
    },

    /// Resolve a server hostname to IPv4 addresses
    Resolve {
        host: String,
    },

    /// Print (or write) the engine document for a link
    Build {
        link: String,

        /// Write the document here instead of stdout
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Have the engine check the document first
        #[arg(long)]
        check: bool,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Keep only the given countries in a geoip data file
    StripGeoip {
        input: PathBuf,
        output: PathBuf,

        /// Country codes to keep (defaults to every supported country)
        #[arg(long, value_delimiter = ',')]
        keep: Vec<String>,
    },

    /// Test configuration and exit
    Test {
        /// Also build this link's document and have the engine check it
        #[arg(long)]
        link: Option<String>,

        #[command(flatten)]
        policy: PolicyArgs,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct PolicyArgs {
    /// ISO 3166-1 alpha-2 country code to bypass
    #[arg(long)]
    country: Option<String>,

    /// Extra domains routed direct
    #[arg(long = "domain")]
    domains: Vec<String>,

    /// Bypass the country's top-level domain
    #[arg(long)]
    bypass_tld: bool,

    /// Bypass government domains
    #[arg(long)]
    bypass_government: bool,

    /// Bypass streaming services
    #[arg(long)]
    bypass_streaming: bool,

    /// Bypass e-commerce sites
    #[arg(long)]
    bypass_ecommerce: bool,
}

impl PolicyArgs {
    fn into_policy(self) -> RoutingPolicy {
        RoutingPolicy {
            country_code: self.country,
            custom_domains: self.domains,
            bypass_tld: self.bypass_tld,
            bypass_government: self.bypass_government,
            bypass_streaming: self.bypass_streaming,
            bypass_ecommerce: self.bypass_ecommerce,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .enable_all()
        .thread_name("pulse-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(ref dir) = args.directory {
        if dir.is_dir() {
            std::env::set_current_dir(dir)?;
        }
    }

    let level = configured_log_level(&args.config);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("pulse_tunnel={}", level).parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    if let Some(ref dir) = args.directory {
        info!("Using configuration directory: {}", dir.display());
    }

    match args.command {
        Command::Parse { link } => {
            let servers = parse_subscription(&link);
            if servers.is_empty() {
                anyhow::bail!("no vless link found in input");
            }
            for descriptor in servers {
                println!("{}", serde_json::to_string_pretty(&descriptor)?);
            }
        }
        Command::Resolve { host } => {
            let resolver = dns::SystemResolver::new();
            let addrs = resolver.resolve_ipv4(&host).await?;
            for addr in addrs {
                println!("{}", addr);
            }
        }
        Command::Build {
            link,
            output,
            check,
            policy,
        } => {
            let (descriptor, document) = document_for_link(&link, &policy.into_policy())?;
            let document = normalize(document);
            info!("Built document for {}", descriptor.display_name());
            if check {
                check_document(&load_config(&args.config)?, document.clone()).await?;
            }
            match output {
                Some(path) => {
                    write_document(&document, &path).await?;
                    info!("Wrote {}", path.display());
                }
                None => println!("{}", document.to_json_pretty()?),
            }
        }
        Command::StripGeoip {
            input,
            output,
            keep,
        } => {
            let keep: HashSet<String> = if keep.is_empty() {
                geo::default_keep_set()
            } else {
                keep.iter().map(|c| c.to_ascii_uppercase()).collect()
            };
            let data = tokio::fs::read(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let stripped = strip_geoip(&data, &keep)?;
            tokio::fs::write(&output, &stripped)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            info!(
                "Stripped {} -> {} bytes ({} countries kept)",
                data.len(),
                stripped.len(),
                keep.len()
            );
        }
        Command::Test { link, policy } => {
            let config = load_config(&args.config)?;
            if let Some(link) = link {
                let (_, document) = document_for_link(&link, &policy.into_policy())?;
                check_document(&config, normalize(document)).await?;
            }
            info!("Configuration test passed");
        }
        Command::Connect {
            link,
            saved,
            external_controller,
            secret,
            policy,
        } => {
            let mut config = load_config(&args.config)?;
            if let Some(ext_ctl) = external_controller {
                config.external_controller = Some(ext_ctl);
            }
            if let Some(secret) = secret {
                config.secret = Some(secret);
            }

            let source = match link {
                Some(link) => Some(TunnelSource::Link {
                    link,
                    policy: policy.into_policy(),
                }),
                None if saved => Some(TunnelSource::Saved),
                None => None,
            };

            let client = Client::new(config)?;
            if let Err(e) = client.run(source).await {
                error!("Client error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Have the configured engine check a document
async fn check_document(config: &Config, document: ConfigDocument) -> anyhow::Result<()> {
    let adapter = engine_adapter(config);
    let data_dir = config.data_dir.clone();
    tokio::task::spawn_blocking(move || adapter.test_config(&data_dir, &document))
        .await?
        .context("engine rejected the document")?;
    info!("Engine accepted the document");
    Ok(())
}

/// `log-level` from the config file, `info` when unset or unreadable
fn configured_log_level(path: &PathBuf) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| Config::from_str(&content).ok())
        .and_then(|config| config.log_level)
        .unwrap_or_else(|| "info".to_string())
}

/// Config from file, or defaults when the file does not exist
fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if !path.exists() {
        info!("{} not found, using defaults", path.display());
        return Ok(Config::default());
    }
    info!("Loading configuration from: {}", path.display());
    Config::load(&path.to_string_lossy())
        .with_context(|| format!("loading {}", path.display()))
}
