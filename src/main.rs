//! docpool - command-line client
//!
//! Connects a pool to one or more servers, runs a single JSON query term (or
//! asks the first server to describe itself), prints the result and drains.

use anyhow::Context;
use docpool::{connect_pool, PoolConfig, Query, ServerAddress};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Client configuration
struct Config {
    pool: PoolConfig,
    /// JSON term to run; `None` asks for server info
    query: Option<String>,
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> anyhow::Result<Self> {
        let mut pool = PoolConfig::default();
        let mut servers: Vec<ServerAddress> = Vec::new();
        let mut query = None;
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || {
                args.get(i + 1)
                    .cloned()
                    .with_context(|| format!("{} requires a value", flag))
            };
            match flag {
                "--server" | "-s" => {
                    servers.push(value()?.parse()?);
                    i += 2;
                }
                "--min" => {
                    pool.min = value()?.parse().context("invalid --min")?;
                    i += 2;
                }
                "--max" => {
                    pool.max = value()?.parse().context("invalid --max")?;
                    i += 2;
                }
                "--auth-key" => {
                    pool.connection.auth_key = value()?;
                    i += 2;
                }
                "--query" | "-q" => {
                    query = Some(value()?);
                    i += 2;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("docpool version {}", docpool::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    print_help();
                    anyhow::bail!("unknown argument: {}", flag);
                }
            }
        }

        if !servers.is_empty() {
            pool.servers = servers;
        }
        pool.validate()?;

        Ok(Self { pool, query })
    }
}

fn print_help() {
    println!(
        r#"
docpool - connection-pooling document database client

USAGE:
    docpool [OPTIONS]

OPTIONS:
    -s, --server <HOST[:PORT]>  Server to connect to, repeatable (default: localhost:{port})
        --min <N>               Connections kept open per server (default: 1)
        --max <N>               Connection limit per server (default: 10)
        --auth-key <KEY>        Authorization key for the handshake
    -q, --query <JSON>          Query term to run; without it, prints server info
    -v, --version               Print version information
    -h, --help                  Print this help message

EXAMPLES:
    docpool -q '[59, []]'                       # list databases
    docpool -s db1 -s db2:29015 -q '"hello"'    # two servers, round-robin
    RUST_LOG=docpool=debug docpool              # verbose pool activity
"#,
        port = docpool::DEFAULT_PORT
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;

    // Logs go to stderr so results can be piped
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let master = connect_pool(config.pool).await?;

    let work = async {
        match &config.query {
            Some(text) => {
                let term: serde_json::Value =
                    serde_json::from_str(text).context("query is not valid JSON")?;
                let response = master.run(&Query::new(term)).await?;
                let output = match response.atom() {
                    Some(atom) => serde_json::to_string_pretty(atom)?,
                    None => serde_json::to_string_pretty(&response.results)?,
                };
                println!("{}", output);
            }
            None => {
                let pool = master
                    .pools()
                    .first()
                    .context("no pools configured")?;
                let conn = pool.acquire().await?;
                let info = conn.server_info().await;
                pool.release(conn).await;
                println!("{}", serde_json::to_string_pretty(&info?)?);
            }
        }
        anyhow::Ok(())
    };

    let result = tokio::select! {
        result = work => result,
        _ = signal::ctrl_c() => {
            warn!("interrupted");
            Ok(())
        }
    };

    master.drain().await;
    info!("client shutdown complete");
    result
}
