use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow, ensure};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("framed_chat_relay");

    // Relay logs go to a pipe that is only read up to the second join; the
    // few lines written after that fit in the pipe buffer.
    let mut relay = Command::new(&binary)
        .args(["relay", "--listen", "127.0.0.1:0"])
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn relay")?;
    let mut relay_log = BufReader::new(relay.stdout.take().context("relay stdout")?);

    // Banner: "... relay listening on 127.0.0.1:PORT"
    let banner = next_line(&mut relay_log, "relay banner").await?;
    let addr = banner
        .split_whitespace()
        .last()
        .with_context(|| format!("unexpected relay banner: {banner}"))?;
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("relay banner missing port: {banner}"))?;

    let mut alice = ClientProcess::spawn(&binary, "alice", host, port).await?;
    wait_for_join(&mut relay_log, "alice").await?;
    let mut bob = ClientProcess::spawn(&binary, "bob", host, port).await?;
    wait_for_join(&mut relay_log, "bob").await?;

    alice.send_line("Hello from Alice").await?;
    assert_eq!(
        next_line(&mut bob.stdout, "bob hears alice").await?,
        "<alice> Hello from Alice"
    );

    // No echo: the next thing Alice sees is Bob's reply, not her own line.
    bob.send_line("Hi Alice!").await?;
    assert_eq!(
        next_line(&mut alice.stdout, "alice hears bob").await?,
        "<bob> Hi Alice!"
    );

    for client in [&mut alice, &mut bob] {
        client.send_line("/quit").await?;
        assert_eq!(
            next_line(&mut client.stdout, "quit confirmation").await?,
            "*** leaving chat"
        );
        let status = client.child.wait().await?;
        ensure!(status.success(), "client exited with {status}");
    }

    let _ = relay.kill().await;
    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn spawn(binary: &Path, username: &str, host: &str, port: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["client", "--username", username, "--host", host, "--port", port])
            .env("RUST_LOG", "off")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn client {username}"))?;
        let stdin = child.stdin.take().context("client stdin")?;
        let stdout = child.stdout.take().context("client stdout")?;
        let mut process = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let welcome = next_line(&mut process.stdout, "welcome banner").await?;
        ensure!(
            welcome == format!("*** connected as {username}"),
            "unexpected welcome for {username}: {welcome}"
        );
        Ok(process)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(format!("{line}\n").as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn wait_for_join(relay_log: &mut BufReader<ChildStdout>, username: &str) -> Result<()> {
    loop {
        let line = next_line(relay_log, "relay join log").await?;
        if line.contains("client joined") && line.contains(username) {
            return Ok(());
        }
    }
}

async fn next_line(reader: &mut BufReader<ChildStdout>, what: &str) -> Result<String> {
    let mut line = String::new();
    let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("timed out waiting for {what}"))??;
    ensure!(read > 0, "stream closed while waiting for {what}");
    Ok(line.trim_end().to_string())
}
