use std::{io::Write, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use tidewatch_client::{export_gif, ClientError, Console, ConsoleClient, ConsoleEvent};
use tidewatch_proto::{CommandVerb, FileEntry, Status, StatusKind};
use tokio::time::Instant;
use tracing::debug;

use crate::cli::{Cli, Commands};

/// Quiet period that ends a `send` exchange once the first reply arrived.
const REPLY_SETTLE: Duration = Duration::from_millis(500);

pub async fn run(cli: Cli) -> Result<()> {
    let wait = cli.wait();
    let mut client = ConsoleClient::connect(&cli.url, wait)
        .await
        .with_context(|| format!("connecting to {}", cli.url))?;
    let handshake = client.handshake();
    println!(
        "connected to {} {} as {}",
        handshake.server_name, handshake.version, handshake.connection_id
    );

    let mut console = Console::new();
    let result = match cli.command {
        Commands::Ls { path } => list(&mut client, &mut console, &path, wait).await,
        Commands::Download { path, out } => {
            client.send(CommandVerb::DownloadFile, &path).await?;
            loop {
                match next_event(&mut client, &mut console, wait).await? {
                    ConsoleEvent::DownloadStarted {
                        size, content_type, ..
                    } => println!("receiving {path}: {size} bytes ({content_type})"),
                    ConsoleEvent::DownloadComplete(download) => {
                        let saved = download
                            .save_to(&out)
                            .await
                            .with_context(|| format!("saving into {}", out.display()))?;
                        println!("saved {} bytes to {}", download.bytes.len(), saved.display());
                        break Ok(());
                    }
                    ConsoleEvent::DownloadFailed { error, .. } => break Err(error.into()),
                    other => print_event(other)?,
                }
            }
        }
        Commands::Record {
            secs,
            stop_after,
            gif,
            play,
        } => {
            // Nothing arrives while frames are captured, so allow for the
            // full recording on top of the usual wait.
            let idle = wait + Duration::from_secs(u64::from(secs));
            let stop_at = stop_after.map(|after| Instant::now() + Duration::from_secs(after));
            record(&mut client, &mut console, secs, stop_at, idle).await?;

            let player = console.player();
            if player.frame_count() == 0 {
                println!("no frames recorded");
            } else {
                println!(
                    "recorded {} frames ({})",
                    player.frame_count(),
                    player.duration_label()
                );
                if let Some(path) = gif {
                    let frames = player.frames().to_vec();
                    let fps = player.fps();
                    let target = path.clone();
                    let written =
                        tokio::task::spawn_blocking(move || export_gif(&frames, fps, &target))
                            .await
                            .context("gif export task failed")??;
                    println!("wrote {written} frames to {}", path.display());
                }
                if play {
                    play_back(&mut console).await;
                }
            }
            Ok(())
        }
        Commands::Send { text } => {
            client.send_text(&text.join(" ")).await?;
            let first = next_event(&mut client, &mut console, wait).await?;
            print_event(first)?;
            loop {
                match client.next_text_within(REPLY_SETTLE).await {
                    Ok(Some(text)) => {
                        if let Some(event) = console.handle_text(&text) {
                            print_event(event)?;
                        }
                    }
                    Ok(None) | Err(ClientError::Timeout(_)) => break Ok(()),
                    Err(err) => break Err(err.into()),
                }
            }
        }
    };

    if let Err(err) = client.close().await {
        debug!("close failed: {err}");
    }
    result
}

async fn list(
    client: &mut ConsoleClient,
    console: &mut Console,
    path: &str,
    wait: Duration,
) -> Result<()> {
    client.send(CommandVerb::ListDir, path).await?;
    loop {
        match next_event(client, console, wait).await? {
            ConsoleEvent::Listing { path, items } => {
                println!("{path}");
                for entry in &items {
                    println!("{}", format_entry(entry));
                }
                println!("{} entries", items.len());
                return Ok(());
            }
            other => print_event(other)?,
        }
    }
}

async fn record(
    client: &mut ConsoleClient,
    console: &mut Console,
    secs: u32,
    stop_at: Option<Instant>,
    idle: Duration,
) -> Result<()> {
    client.send(CommandVerb::StartCam, &secs.to_string()).await?;
    let mut stop_at = stop_at;
    loop {
        let within = match stop_at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => idle,
        };
        let text = match client.next_text_within(within).await {
            Ok(Some(text)) => text,
            Ok(None) => bail!("server closed the connection"),
            Err(ClientError::Timeout(_)) if stop_at.is_some() => {
                println!("stopping early");
                client.send(CommandVerb::StopCam, "").await?;
                stop_at = None;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let Some(event) = console.handle_text(&text) else {
            continue;
        };
        match event {
            ConsoleEvent::RecordingStarted => println!("recording {secs}s..."),
            ConsoleEvent::RecordingLoading { count } => println!("receiving {count} frames"),
            ConsoleEvent::RecordingReady { .. } | ConsoleEvent::RecordingEmpty => return Ok(()),
            other => print_event(other)?,
        }
    }
}

async fn play_back(console: &mut Console) {
    let player = console.player_mut();
    let duration = player.duration_label();
    let fps = player.fps() as usize;
    let mut stdout = std::io::stdout();
    player
        .run(|index, _| {
            if fps > 0 && index % fps == 0 {
                let elapsed = tidewatch_client::format_clock(Duration::from_secs((index / fps) as u64));
                let _ = write!(stdout, "\r{elapsed} / {duration}");
                let _ = stdout.flush();
            }
        })
        .await;
    println!("\r{} / {duration}", player.elapsed_label());
}

/// Waits for the next message that means something to the operator.
async fn next_event(
    client: &mut ConsoleClient,
    console: &mut Console,
    wait: Duration,
) -> Result<ConsoleEvent> {
    loop {
        let text = client
            .next_text_within(wait)
            .await?
            .ok_or_else(|| anyhow!("server closed the connection"))?;
        if let Some(event) = console.handle_text(&text) {
            return Ok(event);
        }
    }
}

/// Prints an event that does not end the current exchange. Error statuses
/// end it with an error.
fn print_event(event: ConsoleEvent) -> Result<()> {
    match event {
        ConsoleEvent::Status(Status {
            status: StatusKind::Error,
            message,
        }) => bail!(message),
        ConsoleEvent::Status(status) => println!("{}", status.message),
        ConsoleEvent::Echo(text) => println!("{text}"),
        ConsoleEvent::Listing { path, items } => {
            println!("{path}: {} entries", items.len())
        }
        ConsoleEvent::DownloadFailed { path, error } => bail!("download of {path} failed: {error}"),
        other => debug!(?other, "ignoring event"),
    }
    Ok(())
}

fn format_entry(entry: &FileEntry) -> String {
    let modified = entry
        .last_modified
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    if entry.is_directory {
        format!("  {:>12}  {modified:16}  {}/", "<dir>", entry.name)
    } else {
        format!("  {:>12}  {modified:16}  {}", entry.size, entry.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn entries_render_directories_with_a_slash() {
        let dir = FileEntry {
            name: "logs".into(),
            full_path: "/srv/logs".into(),
            is_directory: true,
            size: 0,
            last_modified: None,
        };
        let file = FileEntry {
            name: "a.txt".into(),
            full_path: "/srv/a.txt".into(),
            is_directory: false,
            size: 42,
            last_modified: None,
        };
        assert!(format_entry(&dir).ends_with("logs/"));
        assert!(format_entry(&dir).contains("<dir>"));
        assert!(format_entry(&file).contains("42"));
        assert!(format_entry(&file).ends_with("a.txt"));
    }

    #[test_timeout::timeout]
    fn error_status_ends_the_exchange() {
        let err = print_event(ConsoleEvent::Status(Status::error("Path not found: /x"))).unwrap_err();
        assert_eq!(err.to_string(), "Path not found: /x");
        assert!(print_event(ConsoleEvent::Echo("PONG".into())).is_ok());
    }
}
