use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tftpd::config::{LogFormat, LoggingConfig, load_config, validate_config, write_config};
use tftpd::{AuditLogger, TftpConfig, TftpError, TftpServer};

#[derive(Parser, Debug)]
#[command(name = "tftpd-server", about = "Read-only TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/tftpd/tftpd.toml")]
    config: PathBuf,

    /// Write the effective TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// DATA payload size in bytes
    #[arg(long)]
    block_size: Option<usize>,

    /// Base retransmission timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Send attempts per block before a client is dropped
    #[arg(long)]
    try_limit: Option<u32>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut TftpConfig) {
        if let Some(ref root_dir) = self.root_dir {
            config.root_dir = root_dir.clone();
        }
        if let Some(bind_addr) = self.bind {
            config.bind_addr = bind_addr;
        }
        if let Some(block_size) = self.block_size {
            config.session.block_size = block_size;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.session.timeout_ms = timeout_ms;
        }
        if let Some(try_limit) = self.try_limit {
            config.session.try_limit = try_limit;
        }
    }
}

/// Install the global subscriber; the guard must live as long as the process
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&logging.level)
        .map_err(|e| TftpError::Config(format!("Invalid logging.level: {}", e)))?;

    let (writer, guard) = match logging.file {
        Some(ref log_file) => {
            let dir = match log_file.parent() {
                Some(path) => path,
                None => std::path::Path::new("."),
            };
            let file_name = log_file
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    TftpError::Config("logging.file must include a file name".to_string())
                })?;
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (non_blocking, Some(guard))
        }
        None => {
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
            (non_blocking, Some(guard))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_found = cli.config.exists();
    let mut config = if config_found {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };
    cli.apply_overrides(&mut config);

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;

    let _log_guard = init_logging(&config.logging)?;
    let audit = AuditLogger::new(config.logging.audit_enabled);
    if config_found {
        audit.configuration_loaded(&cli.config);
    }

    let server = TftpServer::bind(&config, audit).await?;
    audit.server_started(
        server.local_addr()?,
        &config.root_dir,
        config.session.block_size,
        config.session.try_limit,
    );

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl-C");
        })
        .await?;

    Ok(())
}
