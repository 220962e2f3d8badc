//! Shardcache - sharded in-memory LRU cache
//!
//! One binary runs either role: a master that routes over the hash ring,
//! or an auxiliary that holds a slice of the keyspace.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use shardcache_core::config::{parse_node_list, ShardCacheConfig};
use shardcache_server::{AuxiliaryServer, MasterServer};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "shardcache")]
#[command(author = "Shardcache Team")]
#[command(version = shardcache_core::VERSION)]
#[command(about = "Sharded in-memory LRU cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Bind address
    #[arg(long, global = true, env = "SHARDCACHE_BIND_ADDRESS")]
    bind: Option<String>,

    /// Port number
    #[arg(short, long, global = true, env = "SHARDCACHE_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SHARDCACHE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true, env = "SHARDCACHE_LOG_FORMAT")]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the routing master
    Master(MasterArgs),

    /// Run a cache node
    Auxiliary(AuxiliaryArgs),

    /// Show version information
    Version,
}

#[derive(Args)]
struct MasterArgs {
    /// Comma separated host:port list of auxiliaries
    #[arg(long, env = "SHARDCACHE_AUX_SERVERS")]
    aux_servers: Option<String>,

    /// Virtual points per node on the hash ring
    #[arg(long, env = "SHARDCACHE_REPLICAS")]
    replicas: Option<usize>,

    /// Disaster-recovery backup file
    #[arg(long, env = "SHARDCACHE_BACKUP_PATH")]
    backup_path: Option<PathBuf>,
}

#[derive(Args)]
struct AuxiliaryArgs {
    /// Node id announced to the master (host:port)
    #[arg(long, env = "SHARDCACHE_NODE_ID")]
    node_id: Option<String>,

    /// LRU capacity in entries
    #[arg(long, env = "SHARDCACHE_CAPACITY")]
    capacity: Option<usize>,

    /// host:port of the master
    #[arg(long, env = "SHARDCACHE_MASTER_SERVER")]
    master: Option<String>,

    /// Snapshot directory
    #[arg(long, env = "SHARDCACHE_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Load or create config
    let mut config = if let Some(config_path) = &cli.config {
        ShardCacheConfig::from_file(config_path)?
    } else {
        ShardCacheConfig::from_env()
    };

    // Override with CLI args
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_logging(&config.logging.level, &config.logging.format);

    match cli.command {
        Some(Commands::Master(args)) => {
            if let Some(servers) = args.aux_servers {
                config.master.aux_servers = parse_node_list(&servers);
            }
            if let Some(replicas) = args.replicas {
                config.master.replicas = replicas;
            }
            if let Some(path) = args.backup_path {
                config.master.backup_path = path;
            }

            print_banner();
            info!("Starting Shardcache master...");
            info!("Backup file: {:?}", config.master.backup_path);
            MasterServer::new(config).run().await?;
        }
        Some(Commands::Auxiliary(args)) => {
            if let Some(node_id) = args.node_id {
                config.auxiliary.node_id = Some(node_id);
            }
            if let Some(capacity) = args.capacity {
                config.auxiliary.capacity = capacity;
            }
            if let Some(master) = args.master {
                config.auxiliary.master_endpoint = master;
            }
            if let Some(dir) = args.data_dir {
                config.auxiliary.snapshot_dir = dir;
            }

            print_banner();
            info!("Starting Shardcache auxiliary...");
            info!("Snapshot directory: {:?}", config.auxiliary.snapshot_dir);
            AuxiliaryServer::new(config).run().await?;
        }
        Some(Commands::Version) | None => {
            print_banner();
        }
    }

    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

fn print_banner() {
    println!(
        r#"
    _____ __                    __                __
   / ___// /_  ____ __________/ /________ ______/ /_  ___
   \__ \/ __ \/ __ `/ ___/ __  / ___/ __ `/ ___/ __ \/ _ \
  ___/ / / / / /_/ / /  / /_/ / /__/ /_/ / /__/ / / /  __/
 /____/_/ /_/\__,_/_/   \__,_/\___/\__,_/\___/_/ /_/\___/

   Sharded In-Memory LRU Cache
   Version: {}
"#,
        shardcache_core::VERSION
    );
}
