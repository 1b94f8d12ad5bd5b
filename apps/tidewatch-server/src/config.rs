use std::{
    fmt,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::Parser;
use tidewatch_proto::DEFAULT_MAX_STREAM_BYTES;

use crate::capture::{CaptureSource, FfmpegSource, NoCamera, TestPatternSource};

#[derive(Debug, Parser)]
#[command(
    name = "tidewatch-server",
    author,
    version,
    about = "Remote console server: directory listings, chunked downloads and camera recordings over WebSocket"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "TIDEWATCH_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Directory that listings and downloads are confined to. Defaults to the
    /// current user's home directory.
    #[arg(long, env = "TIDEWATCH_ROOT")]
    pub root: Option<PathBuf>,

    /// Largest file, in bytes, that download_file will stream.
    #[arg(long, env = "TIDEWATCH_MAX_STREAM_BYTES", default_value_t = DEFAULT_MAX_STREAM_BYTES)]
    pub max_stream_bytes: u64,

    /// Capture device: `test-pattern`, `ffmpeg:<input>` or `none`.
    #[arg(long, env = "TIDEWATCH_CAMERA", default_value = "test-pattern")]
    pub camera: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TIDEWATCH_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSpec {
    TestPattern,
    Ffmpeg(String),
    None,
}

impl CameraSpec {
    pub fn source(&self) -> Arc<dyn CaptureSource> {
        match self {
            CameraSpec::TestPattern => Arc::new(TestPatternSource),
            CameraSpec::Ffmpeg(input) => Arc::new(FfmpegSource::new(input.clone())),
            CameraSpec::None => Arc::new(NoCamera),
        }
    }
}

impl FromStr for CameraSpec {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        match value {
            "test-pattern" => return Ok(CameraSpec::TestPattern),
            "none" => return Ok(CameraSpec::None),
            _ => {}
        }
        match value.strip_prefix("ffmpeg:") {
            Some(input) if !input.trim().is_empty() => Ok(CameraSpec::Ffmpeg(input.to_string())),
            Some(_) => bail!("ffmpeg camera needs an input, e.g. ffmpeg:/dev/video0"),
            None => bail!("unknown camera {value:?}; expected test-pattern, ffmpeg:<input> or none"),
        }
    }
}

impl fmt::Display for CameraSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSpec::TestPattern => f.write_str("test-pattern"),
            CameraSpec::Ffmpeg(input) => write!(f, "ffmpeg:{input}"),
            CameraSpec::None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub root: PathBuf,
    pub max_stream_bytes: u64,
    pub camera: CameraSpec,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Loopback config on an ephemeral port with the test pattern camera.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            root: root.into(),
            max_stream_bytes: DEFAULT_MAX_STREAM_BYTES,
            camera: CameraSpec::TestPattern,
            shutdown_grace: Duration::ZERO,
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let root = match cli.root {
            Some(root) => root,
            None => dirs::home_dir().context("no home directory; set TIDEWATCH_ROOT")?,
        };
        if cli.max_stream_bytes == 0 {
            bail!("max stream bytes must be greater than zero");
        }
        let camera = cli
            .camera
            .parse()
            .with_context(|| format!("invalid camera: {}", cli.camera))?;
        Ok(ServerConfig {
            listen_addr,
            root,
            max_stream_bytes: cli.max_stream_bytes,
            camera,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
