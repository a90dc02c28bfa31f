use clap::Parser;
use otcnode::app_context::AppContext;
use otcnode::config::{self, Config};
use otcnode::network_type::BaseCurrencyNetwork;
use otcnode::shutdown::ShutdownManager;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "otcnode")]
#[command(about = "OTC network P2P storage node", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long)]
    listen_addr: Option<String>,

    /// Seed node as host[:port]; repeat to add more. Replaces the configured list.
    #[arg(long = "seed-node")]
    seed_nodes: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,

    /// Periodically resend our own mailbox entries
    #[arg(long)]
    republish_mailbox: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Print hostname at startup BEFORE any logging
    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            let short_name = hostname_str.split('.').next().unwrap_or(&hostname_str);
            eprintln!("\n╔═══════════════════════════════════════════╗");
            eprintln!("║  🖥️  NODE: {:<30} ║", short_name);
            eprintln!("╚═══════════════════════════════════════════╝\n");
        }
    }

    // Network from the existing config file, regtest otherwise
    let network_type = Config::load_from_file(&args.config)
        .map(|cfg| cfg.node.network_type())
        .unwrap_or(BaseCurrencyNetwork::Regtest);

    if args.generate_config {
        let mut config = Config::default();
        config.node.network = network_type.data_dir_name().to_string();
        config.storage.data_dir = config::get_network_data_dir(&network_type)
            .to_string_lossy()
            .to_string();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config, &network_type) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(listen_addr) = args.listen_addr {
        config.network.listen_address = listen_addr;
    }
    if !args.seed_nodes.is_empty() {
        config.network.seed_nodes = args.seed_nodes;
    }
    if args.republish_mailbox {
        config.mailbox.republish_mailbox_entries = true;
    }

    let _log_guard = setup_logging(&config.logging, args.verbose);

    let network_type = config.node.network_type();
    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_time = option_env!("BUILD_TIME")
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("\n🚀 otcnode v{} ({})", version, git_hash);
    println!("  └─ Build: {}", build_time);
    println!("═══════════════════════════════════════════════════════");
    println!();
    println!("📡 Network: {}", network_type);
    println!("  └─ Magic Bytes: {}", hex::encode(network_type.magic_bytes()));
    println!("  └─ Listen: {}", config.network.full_listen_address(&network_type));
    println!("  └─ Data Dir: {}", config.storage.data_dir);
    println!();

    let mut shutdown_manager = ShutdownManager::new();
    let context = match AppContext::build(config, shutdown_manager.token()) {
        Ok(context) => context,
        Err(e) => {
            tracing::error!("❌ Failed to initialize node: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "🔑 Node pub key {}",
        context.mailbox.key_ring().pub_key_ring().signature_pub_key.to_hex()
    );
    tracing::info!(
        "🌐 {} seed nodes, {} stored entries, {} monitors",
        context.seed_nodes.len(),
        context.storage.len(),
        context.monitors.len()
    );

    if let Err(e) = context.start(&mut shutdown_manager).await {
        tracing::error!("❌ Failed to start node: {}", e);
        std::process::exit(1);
    }

    shutdown_manager.wait_for_shutdown().await;
    tracing::info!("👋 otcnode stopped");
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.output == "file" && !config.file_path.is_empty() {
        let path = Path::new(&config.file_path);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "otcnode.log".to_string());
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
        match config.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).with_writer(writer).init(),
            _ => fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer)
                .init(),
        }
        return Some(guard);
    }

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    // Get hostname - shorten to first part before dot
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd {
                // journald adds timestamp and hostname itself
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
    None
}

// UTC time and hostname, e.g. "2025-12-10 18:09:43.150 [seed1]"
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
