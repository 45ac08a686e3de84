use std::io::Write as _;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::oneshot,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    session::{SendError, Session},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut session = Session::connect(&args.host, args.port, &args.username)
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?
        .with_max_payload_len(args.max_payload_len);
    write_stdout(&format!("*** connected as {}", session.username())).await?;

    let (closed_tx, mut closed_rx) = oneshot::channel();
    session.start_listening(render_incoming, move |reason| {
        let _ = closed_tx.send(reason);
    })?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut session, &mut stdin, &mut input, &mut closed_rx).await?;
    shutdown_session(&mut session).await;

    Ok(())
}

async fn run_client_loop(
    session: &mut Session,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    closed: &mut oneshot::Receiver<String>,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            reason = &mut *closed => {
                let reason = reason.unwrap_or_else(|_| "listener stopped".to_string());
                write_stdout(&format!("*** {reason}")).await?;
                break;
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, session).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &mut Session,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    match session.send(text).await {
        Ok(()) => Ok(true),
        Err(err @ SendError::PayloadTooLarge { .. }) => {
            write_stderr(&format!("!!! {err}")).await?;
            Ok(true)
        }
        // The listener reports the dead connection; keep reading until it does.
        Err(err) => {
            warn!(error = ?err, "failed to send message");
            write_stderr(&format!("!!! failed to send: {err}")).await?;
            Ok(true)
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_session(session: &mut Session) {
    if let Err(error) = session.close().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

/// Runs on the listening task, so it writes synchronously.
fn render_incoming(username: String, message: String) {
    let mut stdout = std::io::stdout().lock();
    if let Err(error) = writeln!(stdout, "<{username}> {message}").and_then(|()| stdout.flush()) {
        warn!(?error, "failed to print incoming message");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
