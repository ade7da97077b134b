//! The four launch modes: stdio, Unix-domain-socket server, shim (forward
//! stdio to a server), and hybrid (shim with stdio fallback).

use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tower_lsp::{LspService, Server};

use crate::lsp::backend::Backend;

pub async fn run_stdio() -> anyhow::Result<()> {
    let (service, socket) = LspService::build(Backend::new).finish();
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    Server::new(stdin, stdout, socket).serve(service).await;
    Ok(())
}

/// Binds `socket_path` and spawns one `tower-lsp` server per accepted
/// connection, mirroring the original's accept-loop plus one task per
/// client; waits on SIGINT/SIGTERM to tear every task down.
pub async fn run_server(socket_path: &str) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(socket = socket_path, "listening for connections");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                tasks.retain(|h| !h.is_finished());
                tasks.push(tokio::spawn(async move {
                    let (read, write) = tokio::io::split(stream);
                    let (service, socket) = LspService::build(Backend::new).finish();
                    Server::new(read, write, socket).serve(service).await;
                }));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    for task in tasks {
        task.abort();
    }
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

/// Connect to `socket_path` and relay bytes bidirectionally between it and
/// this process's stdin/stdout, mirroring `shim_stdin`/`shim_stdout`.
async fn pump(stream: UnixStream) -> anyhow::Result<()> {
    let (mut sock_read, mut sock_write) = stream.into_split();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let to_socket = tokio::io::copy(&mut stdin, &mut sock_write);
    let to_stdout = tokio::io::copy(&mut sock_read, &mut stdout);
    tokio::select! {
        res = to_socket => { res?; }
        res = to_stdout => { res?; }
    }
    Ok(())
}

pub async fn run_shim(socket_path: &str) -> anyhow::Result<()> {
    let stream = UnixStream::connect(socket_path).await?;
    pump(stream).await
}

/// Same as `run_shim`, but falls back to serving directly over stdio
/// in-process if the socket cannot be reached at all.
pub async fn run_hybrid(socket_path: &str) -> anyhow::Result<()> {
    match UnixStream::connect(socket_path).await {
        Ok(stream) => pump(stream).await,
        Err(err) => {
            tracing::warn!(%err, socket = socket_path, "shim connect failed, falling back to stdio");
            run_stdio().await
        }
    }
}
