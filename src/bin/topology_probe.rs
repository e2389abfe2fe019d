use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use confmon::timeouts::{DEFAULT_DATA_PORT, DEFAULT_MGMT_PORT};
use confmon::{
    load_settings, ConfigEvent, ConfigInfo, Confmon, Hostlist, Listener, ProviderKind,
    RefreshOptions, Settings, TcpConnector,
};
use env_logger::Env;
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProbeProvider {
    /// Every provider the connection type enables.
    Auto,
    Cccp,
    Http,
    Raw,
    Admin,
}

/// Bootstrap a cluster map and print it as JSON.
#[derive(Parser, Debug, Clone)]
struct Cli {
    /// Settings YAML; command-line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bootstrap host, `host[:port]`; repeat or separate with `;`
    #[arg(long = "host", required = true)]
    hosts: Vec<String>,

    #[arg(long)]
    bucket: Option<String>,

    #[arg(long, value_enum, default_value_t = ProbeProvider::Auto)]
    provider: ProbeProvider,

    /// Cache file to read at bootstrap and rewrite on every new map
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Keep running and print every newly accepted revision
    #[arg(long)]
    watch: bool,

    /// Refresh period while watching, in milliseconds
    #[arg(long, default_value_t = 5000)]
    refresh_ms: u64,

    /// env_logger-style filter string (e.g. "info,confmon=debug"); overrides RUST_LOG/defaults
    #[arg(long)]
    log_filter: Option<String>,
}

const DEFAULT_LOG_FILTER: &str = "warn,confmon=info";

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format(|buf, record| {
        let ts = buf.timestamp_millis();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

/// Prints a line for every accepted map.
struct RevisionPrinter;

impl Listener for RevisionPrinter {
    fn on_config_event(&self, event: ConfigEvent, config: Option<&Arc<ConfigInfo>>) {
        if let (ConfigEvent::GotNewConfig, Some(config)) = (event, config) {
            println!(
                "rev={} origin={} servers={}",
                config
                    .revision()
                    .map_or_else(|| "-".to_string(), |rev| rev.to_string()),
                config.origin(),
                config.server_count()
            );
        }
    }
}

fn build_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => load_settings(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(bucket) = &cli.bucket {
        settings.bucket = bucket.clone();
    }
    if let Some(cache) = &cli.cache {
        settings.config_cache = Some(cache.clone());
    }
    settings.validate().context("validating settings")?;
    Ok(settings)
}

fn host_list(specs: &[String], default_port: u16) -> Result<Hostlist> {
    let mut hosts = Hostlist::new();
    for spec in specs {
        hosts
            .add_specs(spec, default_port)
            .with_context(|| format!("parsing host `{spec}`"))?;
    }
    if hosts.is_empty() {
        bail!("no bootstrap hosts given");
    }
    Ok(hosts)
}

fn select_providers(monitor: &mut Confmon, choice: ProbeProvider) {
    let only = match choice {
        ProbeProvider::Auto => return,
        ProbeProvider::Cccp => ProviderKind::Cccp,
        ProbeProvider::Http => ProviderKind::Http,
        ProbeProvider::Raw => ProviderKind::McRaw,
        ProbeProvider::Admin => ProviderKind::ClAdmin,
    };
    for kind in ProviderKind::ORDERED {
        if kind != ProviderKind::File {
            monitor.set_active(kind, kind == only);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());
    let settings = build_settings(&cli)?;
    let data_hosts = host_list(&cli.hosts, DEFAULT_DATA_PORT)?;
    let mgmt_hosts = host_list(&cli.hosts, DEFAULT_MGMT_PORT)?;

    let mut monitor = Confmon::new(settings, Arc::new(TcpConnector::new()));
    select_providers(&mut monitor, cli.provider);
    monitor.configure_nodes(ProviderKind::Cccp, &data_hosts);
    monitor.configure_nodes(ProviderKind::McRaw, &data_hosts);
    monitor.configure_nodes(ProviderKind::Http, &mgmt_hosts);
    monitor.configure_nodes(ProviderKind::ClAdmin, &mgmt_hosts);
    info!(
        "probing bucket {} via [{}]",
        monitor.settings().bucket,
        monitor
            .active_providers()
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(",")
    );

    let config = match monitor.bootstrap().await {
        Ok(config) => config,
        Err(err) => {
            warn!("bootstrap failed:\n{}", monitor.dump());
            return Err(err).context("bootstrapping cluster map");
        }
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&config.to_json()).context("encoding map")?
    );
    if !cli.watch {
        return Ok(());
    }

    monitor.add_listener(Arc::new(RevisionPrinter));
    let mut ticker = tokio::time::interval(Duration::from_millis(cli.refresh_ms.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping monitor");
                monitor.stop();
                monitor.run_pending();
                return Ok(());
            }
            _ = ticker.tick() => {
                monitor.request_refresh(RefreshOptions::default());
            }
            pumped = monitor.pump() => pumped?,
        }
    }
}
