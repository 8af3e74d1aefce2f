use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const ROOM: &str = "course-42";

#[tokio::test]
async fn cli_course_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("learnsphere_chat");

    let mut server = Process::spawn(&binary, &["serve", "--listen", "127.0.0.1:0"], "info")?;
    let banner = server.next_line("listening banner").await?;
    let addr = banner
        .rsplit(' ')
        .next()
        .filter(|addr| addr.contains(':'))
        .with_context(|| format!("unexpected server banner: {banner}"))?;
    let url = format!("ws://{addr}/ws");

    // Keep reading server logs so the pipe never fills.
    let mut server_logs = server.stdout;
    let server_log_task = tokio::spawn(async move {
        let mut line = String::new();
        while matches!(server_logs.read_line(&mut line).await, Ok(n) if n > 0) {
            line.clear();
        }
    });

    let mut alice = join_as(&binary, "A", "Alice", &url).await?;
    let mut bob = join_as(&binary, "B", "Bob", &url).await?;

    // Joins carry no acknowledgement; give the server a moment to register both.
    sleep(Duration::from_millis(200)).await;

    // Alice greets the room; Bob hears it and Alice sees her own echo.
    alice.send_line("Hello from Alice").await?;
    let expected = "[course-42] <Alice> Hello from Alice";
    assert_eq!(bob.next_line("bob hears alice").await?, expected);
    assert_eq!(alice.next_line("alice echo").await?, expected);

    bob.send_line("Hi Alice!").await?;
    let expected = "[course-42] <Bob> Hi Alice!";
    assert_eq!(alice.next_line("alice hears bob").await?, expected);
    assert_eq!(bob.next_line("bob echo").await?, expected);

    for client in [&mut alice, &mut bob] {
        client.send_line("/quit").await?;
        assert_eq!(client.next_line("quit").await?, "*** leaving chat");
        let status = client.child.wait().await?;
        assert!(status.success(), "client exited with {status}");
    }

    // The server stays up after clients leave; terminate it manually.
    let _ = server.child.kill().await;
    let _ = server_log_task.await;

    Ok(())
}

/// A `learnsphere_chat` process with piped stdin and stdout.
struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Process {
    fn spawn(binary: &Path, args: &[&str], log_level: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(args)
            .env("RUST_LOG", log_level)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {args:?}"))?;
        let stdin = child.stdin.take().context("stdin missing after spawn")?;
        let stdout = child.stdout.take().context("stdout missing after spawn")?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self, description: &str) -> Result<String> {
        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, self.stdout.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("{description}: timed out"))??;
        if read == 0 {
            return Err(anyhow!("{description}: stream closed"));
        }
        Ok(line.trim_end().to_string())
    }
}

async fn join_as(binary: &Path, user_id: &str, name: &str, url: &str) -> Result<Process> {
    let args = [
        "client",
        "--room",
        ROOM,
        "--user-id",
        user_id,
        "--name",
        name,
        "--server",
        url,
    ];
    let mut client = Process::spawn(binary, &args, "warn")?;

    let banner = client.next_line("join banner").await?;
    if banner != format!("*** joined {ROOM} as {name}") {
        return Err(anyhow!("expected join banner for {name}, got '{banner}'"));
    }
    Ok(client)
}
