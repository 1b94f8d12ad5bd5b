use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use tidewatch_proto::{MAX_RECORDING_SECS, MIN_RECORDING_SECS};

#[derive(Parser, Debug)]
#[command(name = "tidewatch")]
#[command(about = "Browse files, download them and record the camera of a tidewatch server")]
pub struct Cli {
    /// WebSocket endpoint of the server
    #[arg(long, env = "TIDEWATCH_URL", default_value = "ws://127.0.0.1:8080/ws")]
    pub url: String,

    /// Seconds to wait for the server before giving up
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub wait_secs: u64,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List a directory on the server
    Ls {
        path: String,
    },

    /// Download a file into a local directory
    Download {
        path: String,

        /// Directory to save into
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Record the server's camera
    Record {
        /// Recording length in seconds
        #[arg(value_parser = clap::value_parser!(u32).range(MIN_RECORDING_SECS as i64..=MAX_RECORDING_SECS as i64))]
        secs: u32,

        /// Send stop_cam after this many seconds
        #[arg(long)]
        stop_after: Option<u64>,

        /// Write the recording as an animated GIF
        #[arg(long)]
        gif: Option<PathBuf>,

        /// Play the recording back in the terminal
        #[arg(long)]
        play: bool,
    },

    /// Send raw command text and print the replies
    Send {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn record_accepts_the_duration_range_only() {
        let cli = Cli::try_parse_from(["tidewatch", "record", "5", "--stop-after", "2"]).unwrap();
        match cli.command {
            Commands::Record {
                secs, stop_after, ..
            } => {
                assert_eq!(secs, 5);
                assert_eq!(stop_after, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["tidewatch", "record", "4"]).is_err());
        assert!(Cli::try_parse_from(["tidewatch", "record", "301"]).is_err());
    }

    #[test_timeout::timeout]
    fn send_joins_words() {
        let cli = Cli::try_parse_from(["tidewatch", "send", "hello", "there"]).unwrap();
        assert_eq!(cli.wait(), Duration::from_secs(30));
        match cli.command {
            Commands::Send { text } => assert_eq!(text.join(" "), "hello there"),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
