use clap::{Parser, Subcommand};
use dotenv::dotenv;
use packetwire::{
    setup_tracing, AppResult, ConnectedEvent, Connection, PacketwireConfig, Server,
};
use std::path::PathBuf;
use tokio::{runtime, signal};
use tracing::{debug, error, info};

/// Echo server: every packet a client sends is written back to it.
#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    // 加载 .env 文件
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    // an explicit --conf must exist, the default location is optional
    let config = if commandline.conf.is_some() || config_path.exists() {
        PacketwireConfig::set_up_config(&config_path)?
    } else {
        PacketwireConfig::default()
    };

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    let _log_guard = setup_tracing(&config.log)?;

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?;

    rt.block_on(run_echo_server(config))
}

async fn run_echo_server(config: PacketwireConfig) -> AppResult<()> {
    let server = Server::with_config(config.server)?;
    let connected = server.subscribe_connected();
    server.start().await?;

    loop {
        tokio::select! {
            event = connected.recv() => match event {
                Ok(event) => on_connected(event),
                Err(_) => break,
            },
            _ = signal::ctrl_c() => {
                info!("get shutdown signal");
                break;
            }
        }
    }

    server.stop().await;
    info!("echo server shutdown complete");
    Ok(())
}

fn on_connected(event: ConnectedEvent) {
    match (event.connection, event.fault) {
        (Some(connection), None) => {
            tokio::spawn(echo(connection));
        }
        (connection, fault) => {
            error!(?fault, "connection not established");
            if let Some(connection) = connection {
                connection.close();
            }
        }
    }
}

async fn echo(connection: Connection) {
    let received = connection.subscribe_received();
    while let Ok(event) = received.recv().await {
        if let Some(fault) = &event.fault {
            debug!(connection = %connection.id(), %fault, "closing connection");
            break;
        }
        if let Err(err) = connection.write(event.packet) {
            debug!(connection = %connection.id(), %err, "echo write rejected");
            break;
        }
    }
    connection.close();
}
