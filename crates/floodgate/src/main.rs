use anyhow::Context;
use clap::Parser;
use floodgate::{logging, App, Config, Session};
use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// A MongoDB-wire-compatible front end serving synthesized collections.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// The host to bind the wire listener to.
    #[arg(long, default_value = "127.0.0.1", env = "FLOODGATE_HOST")]
    host: String,
    /// The port to listen on for MongoDB wire protocol connections.
    #[arg(long, default_value = "27017", env = "FLOODGATE_PORT")]
    port: u16,
    /// Directory holding one model file per collection.
    #[arg(long, default_value = "./data", env = "FLOODGATE_DATA_DIR")]
    data_dir: PathBuf,

    /// Pending inserts that trigger a training pass.
    #[arg(long, default_value = "10", env = "FLOODGATE_TRAIN_BATCH_SIZE")]
    train_batch_size: usize,
    /// Count surrogate reported for trained collections.
    #[arg(long, default_value = "100", env = "FLOODGATE_COUNT_ESTIMATE")]
    count_estimate: i64,
    /// Maximum number of open server-side cursors.
    #[arg(long, default_value = "1000", env = "FLOODGATE_MAX_CURSORS")]
    max_cursors: usize,
    /// Idle time after which a cursor is closed.
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration, env = "FLOODGATE_CURSOR_TIMEOUT")]
    cursor_timeout: std::time::Duration,
    /// Decoded models kept in the storage LRU cache.
    #[arg(long, default_value = "100", env = "FLOODGATE_MODEL_CACHE_SIZE")]
    model_cache_size: usize,
    /// Maximum number of connections to allow at once.
    #[arg(long, default_value = "300", env = "FLOODGATE_MAX_CONNECTIONS")]
    max_connections: usize,
    /// How long to wait for a request before closing an idle connection.
    #[arg(long, default_value = "30m", value_parser = humantime::parse_duration, env = "FLOODGATE_IDLE_SESSION_TIMEOUT")]
    idle_session_timeout: std::time::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();

    let cli = Cli::parse();
    tracing::info!(
        host = %cli.host,
        port = cli.port,
        data_dir = %cli.data_dir.display(),
        "starting floodgate"
    );

    let config = Config {
        data_dir: cli.data_dir.clone(),
        train_batch_size: cli.train_batch_size.max(1),
        count_estimate: cli.count_estimate,
        max_cursors: cli.max_cursors,
        cursor_timeout: cli.cursor_timeout,
        model_cache_size: cli.model_cache_size,
        ..Config::default()
    };
    let app = Arc::new(App::new(config));

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .context("failed to bind server port")?;

    let cancel_token = tokio_util::sync::CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received ctrl-c, initiating shutdown");
        ctrl_c_token.cancel();
    });

    // Idle-cursor sweeper: at most one sweep per minute.
    let sweeper_app = app.clone();
    let sweeper_token = cancel_token.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = tick.tick() => sweeper_app.cursors.sweep(),
                _ = sweeper_token.cancelled() => return,
            }
        }
    });

    let connection_limit = Arc::new(tokio::sync::Semaphore::new(cli.max_connections));

    // Accept and serve wire sessions until we're signaled to stop.
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((socket, addr)) = accept else {
                    continue;
                };
                socket.set_nodelay(true)?;

                tokio::spawn(serve(
                    Session::new(app.clone()),
                    socket,
                    addr,
                    cli.idle_session_timeout,
                    cancel_token.child_token(),
                    connection_limit.clone(),
                ));
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    Ok(())
}

#[tracing::instrument(level = "info", err(Debug, level = "warn"), skip(session, socket, stop, connection_limit), fields(?addr))]
async fn serve(
    mut session: Session,
    socket: tokio::net::TcpStream,
    addr: std::net::SocketAddr,
    idle_timeout: std::time::Duration,
    stop: tokio_util::sync::CancellationToken,
    connection_limit: Arc<tokio::sync::Semaphore>,
) -> anyhow::Result<()> {
    let permit = match connection_limit.try_acquire() {
        Ok(permit) => permit,
        Err(_) => {
            anyhow::bail!("connection limit reached, rejecting connection");
        }
    };
    tracing::info!("accepted client connection");

    let (reader, mut writer) = tokio::io::split(socket);
    let mut frames = tokio_util::codec::FramedRead::new(reader, wire::codec());
    let mut out = Vec::new();

    let result = async {
        loop {
            tokio::select! {
                frame = frames.try_next() => {
                    let Some(frame) = frame.context("failed to read next request frame")? else {
                        return Ok(());
                    };

                    out.clear();
                    let handled = session.handle_frame(&frame, &mut out);
                    // A protocol failure may still carry a best-effort
                    // error reply; flush it before surfacing the error.
                    writer.write_all(&out).await?;
                    handled?;
                }
                _ = tokio::time::sleep(idle_timeout) => {
                    anyhow::bail!("timeout waiting for next request");
                }
                _ = stop.cancelled() => {
                    anyhow::bail!("signalled to stop");
                }
            }
        }
    }
    .await;

    session.close();
    let _ = writer.shutdown().await;
    drop(permit);

    result
}
