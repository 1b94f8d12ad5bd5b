use std::{net::SocketAddr, path::Path, time::Duration};

use tidewatch_client::{Console, ConsoleClient, ConsoleEvent, PlayerState};
use tidewatch_proto::{CommandVerb, Status, StatusKind, CHUNK_SIZE, SERVER_NAME};
use tidewatch_server::{serve, AppState, ServerConfig};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};

const WAIT: Duration = Duration::from_secs(15);

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(root: &Path) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(ServerConfig::local(root), None).unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, state, async move {
            let _ = rx.await;
        }));
        Self {
            addr,
            shutdown: Some(tx),
            task,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn connect(&self) -> ConsoleClient {
        ConsoleClient::connect(&self.url(), WAIT).await.unwrap()
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

/// Reads until `pick` accepts an event, failing on anything that times out.
async fn wait_for<T>(
    client: &mut ConsoleClient,
    console: &mut Console,
    mut pick: impl FnMut(ConsoleEvent) -> Option<T>,
) -> T {
    loop {
        let text = client
            .next_text_within(WAIT)
            .await
            .unwrap()
            .expect("server closed the connection");
        if let Some(found) = console.handle_text(&text).and_then(&mut pick) {
            return found;
        }
    }
}

fn error_message(event: ConsoleEvent) -> Option<String> {
    match event {
        ConsoleEvent::Status(Status {
            status: StatusKind::Error,
            message,
        }) => Some(message),
        _ => None,
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn handshake_ping_and_echo() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut client = server.connect().await;
    assert_eq!(client.handshake().server_name, SERVER_NAME);

    let mut console = Console::new();
    client.send(CommandVerb::Ping, "").await.unwrap();
    let pong = wait_for(&mut client, &mut console, |event| match event {
        ConsoleEvent::Echo(text) => Some(text),
        _ => None,
    })
    .await;
    assert_eq!(pong, "PONG");

    client.send_text("hello there").await.unwrap();
    let echo = wait_for(&mut client, &mut console, |event| match event {
        ConsoleEvent::Echo(text) => Some(text),
        _ => None,
    })
    .await;
    assert_eq!(echo, "hello there");

    client.close().await.unwrap();
    server.stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn small_file_arrives_in_one_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.txt");
    std::fs::write(&path, b"hello world").unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut client = server.connect().await;
    let mut console = Console::new();

    client
        .send(CommandVerb::DownloadFile, path.to_str().unwrap())
        .await
        .unwrap();
    let download = wait_for(&mut client, &mut console, |event| match event {
        ConsoleEvent::DownloadComplete(download) => Some(download),
        ConsoleEvent::DownloadFailed { error, .. } => panic!("download failed: {error}"),
        _ => None,
    })
    .await;
    assert_eq!(download.bytes, b"hello world");
    assert_eq!(download.file_name, "hello.txt");
    assert_eq!(download.content_type, "text/plain");

    server.stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn failed_listing_leaves_the_connection_usable() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::create_dir(root.join("logs")).unwrap();
    std::fs::write(root.join("a.txt"), b"a").unwrap();
    let server = TestServer::start(&root).await;
    let mut client = server.connect().await;
    let mut console = Console::new();

    let missing = root.join("nope");
    client
        .send(CommandVerb::ListDir, missing.to_str().unwrap())
        .await
        .unwrap();
    let message = wait_for(&mut client, &mut console, error_message).await;
    assert!(message.starts_with("Path not found"), "{message}");

    client
        .send(CommandVerb::ListDir, root.to_str().unwrap())
        .await
        .unwrap();
    let items = wait_for(&mut client, &mut console, |event| match event {
        ConsoleEvent::Listing { items, .. } => Some(items),
        _ => None,
    })
    .await;
    let names: Vec<_> = items.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, ["logs", "a.txt"]);
    assert!(items[0].is_directory);

    server.stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn back_to_back_downloads_reassemble_intact() {
    let dir = tempfile::tempdir().unwrap();
    let big: Vec<u8> = (0..CHUNK_SIZE * 3 + 123).map(|i| (i * 7 % 251) as u8).collect();
    let small: Vec<u8> = (0..CHUNK_SIZE + 1).map(|i| (i % 13) as u8).collect();
    let big_path = dir.path().join("big.bin");
    let small_path = dir.path().join("small.bin");
    std::fs::write(&big_path, &big).unwrap();
    std::fs::write(&small_path, &small).unwrap();

    let server = TestServer::start(dir.path()).await;
    let mut client = server.connect().await;
    let mut console = Console::new();

    client
        .send(CommandVerb::DownloadFile, big_path.to_str().unwrap())
        .await
        .unwrap();
    client
        .send(CommandVerb::DownloadFile, small_path.to_str().unwrap())
        .await
        .unwrap();

    let mut completed = Vec::new();
    while completed.len() < 2 {
        let download = wait_for(&mut client, &mut console, |event| match event {
            ConsoleEvent::DownloadComplete(download) => Some(download),
            ConsoleEvent::DownloadFailed { error, .. } => panic!("download failed: {error}"),
            _ => None,
        })
        .await;
        completed.push(download);
    }
    completed.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    assert_eq!(completed[0].file_name, "big.bin");
    assert_eq!(completed[0].bytes, big);
    assert_eq!(completed[1].file_name, "small.bin");
    assert_eq!(completed[1].bytes, small);
    assert_eq!(console.reassembler().in_progress(), 0);

    server.stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn download_outside_the_root_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("secret.txt");
    std::fs::write(&secret, b"secret").unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut client = server.connect().await;
    let mut console = Console::new();

    client
        .send(CommandVerb::DownloadFile, secret.to_str().unwrap())
        .await
        .unwrap();
    wait_for(&mut client, &mut console, error_message).await;
    assert_eq!(console.reassembler().in_progress(), 0);

    server.stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn five_second_recording_plays_back() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut client = server.connect().await;
    let mut console = Console::new();

    client.send(CommandVerb::StartCam, "5").await.unwrap();
    let ack = wait_for(&mut client, &mut console, |event| match event {
        ConsoleEvent::Status(status) => Some(status),
        _ => None,
    })
    .await;
    assert_eq!(ack, Status::info("Starting camera (5s)..."));

    // A second start while capturing is refused.
    client.send(CommandVerb::StartCam, "5").await.unwrap();
    let refused = wait_for(&mut client, &mut console, error_message).await;
    assert_eq!(refused, "A recording is already in progress");

    let frames = wait_for(&mut client, &mut console, |event| match event {
        ConsoleEvent::RecordingReady { frames } => Some(frames),
        ConsoleEvent::RecordingEmpty => panic!("recording came back empty"),
        _ => None,
    })
    .await;
    // Capture is paced by the wall clock here, so only the ceiling is exact.
    assert!((1..=150).contains(&frames), "{frames} frames");
    assert_eq!(console.player().state(), PlayerState::Playing);
    assert_eq!(console.player().elapsed_label(), "00:00");

    server.stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn observers_cannot_issue_commands() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut observer = ConsoleClient::connect(&format!("{}?role=observer", server.url()), WAIT)
        .await
        .unwrap();
    let mut console = Console::new();

    observer.send(CommandVerb::Ping, "").await.unwrap();
    let message = wait_for(&mut observer, &mut console, error_message).await;
    assert_eq!(message, "Observers cannot issue commands");

    server.stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn health_reports_open_connections() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let _client = server.connect().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"status\":\"ok\""), "{response}");
    assert!(response.contains("\"connections\":1"), "{response}");
    assert!(response.contains(SERVER_NAME), "{response}");

    server.stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn shutdown_notifies_consoles_and_closes() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let mut client = server.connect().await;
    let mut console = Console::new();

    let TestServer {
        shutdown, task, ..
    } = server;
    shutdown.unwrap().send(()).unwrap();

    let notice = wait_for(&mut client, &mut console, |event| match event {
        ConsoleEvent::Status(status) => Some(status),
        _ => None,
    })
    .await;
    assert_eq!(notice, Status::info("Server shutting down"));
    assert_eq!(client.next_text_within(WAIT).await.unwrap(), None);
    task.await.unwrap().unwrap();
}
