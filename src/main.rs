use clap::{Parser, ValueEnum};

use buxn_ls::logging::init_logger;
use buxn_ls::transport;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    Stdio,
    Server,
    Shim,
    Hybrid,
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Language Server Protocol implementation for the Uxntal assembly dialect"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Stdio, help = "Launch mode")]
    mode: Mode,
    #[arg(long, default_value = "@buxn/ls", help = "Unix-domain socket path for server/shim/hybrid modes")]
    socket: String,
    #[arg(
        long,
        default_value = "info",
        help = "Set the logging level for the server",
        value_parser = ["error", "warn", "info", "debug", "trace"]
    )]
    log_level: String,
    #[arg(long, help = "Disable ANSI color output")]
    no_color: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logger(cli.no_color, Some(&cli.log_level)) {
        eprintln!("failed to initialize logger: {err}");
    }

    let result = match cli.mode {
        Mode::Stdio => transport::run_stdio().await,
        Mode::Server => transport::run_server(&cli.socket).await,
        Mode::Shim => transport::run_shim(&cli.socket).await,
        Mode::Hybrid => transport::run_hybrid(&cli.socket).await,
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "fatal transport error");
            std::process::ExitCode::FAILURE
        }
    }
}
