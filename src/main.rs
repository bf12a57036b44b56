//! mysql-es-river — replicate MySQL/MariaDB rows into Elasticsearch.
//!
//! Usage:
//!   mysql-es-river -c river.toml
//!   mysql-es-river -c river.toml --my-addr 127.0.0.1:3306 --es-addr 127.0.0.1:9200

use clap::Parser;
use mysql_es_river::{Config, Flavor, River};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mysql-es-river", version, about = "MySQL to Elasticsearch replication")]
struct Cli {
    /// Path of the TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override my_addr from the config file
    #[arg(long)]
    my_addr: Option<String>,

    /// Override es_addr from the config file
    #[arg(long)]
    es_addr: Option<String>,

    /// Override data_dir from the config file
    #[arg(long)]
    data_dir: Option<String>,

    /// Override server_id from the config file
    #[arg(long)]
    server_id: Option<u32>,

    /// Override flavor from the config file (mysql | mariadb)
    #[arg(long)]
    flavor: Option<String>,

    /// Override the mysqldump executable path
    #[arg(long)]
    mysqldump: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli)?;

    let river = Arc::new(River::new(config).await.map_err(|e| {
        tracing::error!("create river failed: {}", e);
        anyhow::anyhow!(e)
    })?);

    let signal_river = river.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_river.close();
    });

    river.run().await?;
    tracing::info!("river stopped");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::from_file(&cli.config)?;

    if let Some(my_addr) = &cli.my_addr {
        config.my_addr = my_addr.clone();
    }
    if let Some(es_addr) = &cli.es_addr {
        config.es_addr = es_addr.clone();
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(server_id) = cli.server_id {
        config.server_id = server_id;
    }
    if let Some(flavor) = &cli.flavor {
        config.flavor = match flavor.as_str() {
            "mysql" => Flavor::Mysql,
            "mariadb" => Flavor::Mariadb,
            other => anyhow::bail!("unknown flavor {}, expected mysql or mariadb", other),
        };
    }
    if let Some(mysqldump) = &cli.mysqldump {
        config.mysqldump = mysqldump.clone();
    }

    Ok(config)
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
