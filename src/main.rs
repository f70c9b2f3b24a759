use std::{net::SocketAddr, path::PathBuf};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use replaytrack::{
    config::{Config, StoreBackend},
    descriptor::RequestDescriptor,
    logging::{self, LogSettings},
    proxy,
};

#[derive(Debug, Parser)]
#[command(name = "replaytrack")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the record-and-replay proxy.
    Serve {
        /// Path to config TOML.
        #[arg(long)]
        config: PathBuf,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Inspect or remove stored fixtures.
    Fixtures {
        /// Path to config TOML.
        #[arg(long)]
        config: PathBuf,
        #[command(subcommand)]
        action: FixturesCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum FixturesCommand {
    /// Delete fixtures by key.
    Remove {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Print the key a request outside any series would be stored under.
    Key {
        method: String,
        /// Path and query, e.g. `/users?page=2`.
        url: String,
        /// Request header as `name:value`; repeatable.
        #[arg(long = "header")]
        headers: Vec<String>,
        #[arg(long)]
        body: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::from_path(&config)?;
            logging::init(LogSettings::resolve(&config, log_level.as_deref())?)?;
            let proxy = proxy::serve(&config).await?;
            eprintln!("{}", startup_summary(&config, proxy.listen_addr));
            tokio::signal::ctrl_c().await?;
            proxy.shutdown().await;
        }
        Command::Fixtures { config, action } => {
            let config = Config::from_path(&config)?;
            let output = run_fixtures_command(&config, action).await?;
            println!("{output}");
        }
    }

    Ok(())
}

async fn run_fixtures_command(config: &Config, command: FixturesCommand) -> anyhow::Result<String> {
    let engine = proxy::build_engine(config)?;
    match command {
        FixturesCommand::Remove { keys } => {
            engine.remove_fixtures(&keys).await?;
            Ok(format!("removed {} fixture(s)", keys.len()))
        }
        FixturesCommand::Key {
            method,
            url,
            headers,
            body,
        } => {
            let request = parse_request(method, url, &headers, body)?;
            Ok(engine.fixture_key(&request, None)?)
        }
    }
}

fn parse_request(
    method: String,
    url: String,
    headers: &[String],
    body: Option<String>,
) -> anyhow::Result<RequestDescriptor> {
    let mut request = RequestDescriptor::new(method.to_ascii_uppercase(), url);
    for raw in headers {
        let Some((name, value)) = raw.split_once(':') else {
            anyhow::bail!("invalid header `{raw}`; expected `name:value`");
        };
        request = request.with_header(name.trim(), value.trim());
    }
    if let Some(body) = body {
        request = request.with_body(Bytes::from(body));
    }
    Ok(request)
}

fn startup_summary(config: &Config, listen_addr: SocketAddr) -> String {
    let path = config
        .store
        .path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "unset".to_owned());
    let store = match config.store.backend {
        StoreBackend::Memory => "memory".to_owned(),
        StoreBackend::Directory => format!("directory:{path}"),
        StoreBackend::Sqlite => format!("sqlite:{path}"),
    };
    format!(
        "replaytrack listening on {listen_addr}; remote={}; store={store}; prevent_recording={}",
        config.engine.remote, config.engine.prevent_recording
    )
}
