use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "camswitch",
    author,
    version,
    about = "Feeds one synthetic camera into several render threads and switches it between them",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Session configuration (TOML). See `camswitch sample-config`.
    #[arg(long, value_name = "FILE", env = "CAMSWITCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of generated render targets when no config file is given.
    #[arg(long, value_name = "N", conflicts_with = "config")]
    pub targets: Option<usize>,

    /// How long to run before releasing everything (e.g. `3s`, `500ms`).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg, default_value = "3s")]
    pub duration: Duration,

    /// Rotate the feed to the next target this often; overrides `switch_interval`.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
    pub switch_every: Option<Duration>,

    /// Graphics backend driving every render target.
    #[arg(long, value_enum, default_value_t = BackendKind::Headless)]
    pub backend: BackendKind,

    /// Print the run summary as JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print an annotated configuration file.
    SampleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Software handles only; no GPU required.
    Headless,
    /// Offscreen wgpu devices, one per target.
    Wgpu,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Headless => "headless",
            BackendKind::Wgpu => "wgpu",
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

fn parse_duration_arg(raw: &str) -> Result<Duration, String> {
    muxconfig::parse_duration(raw).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "camswitch",
            "--targets",
            "3",
            "--duration",
            "750ms",
            "--switch-every",
            "0.25",
            "--json",
        ])
        .unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.targets, Some(3));
        assert_eq!(cli.run.duration, Duration::from_millis(750));
        assert_eq!(cli.run.switch_every, Some(Duration::from_millis(250)));
        assert_eq!(cli.run.backend, BackendKind::Headless);
        assert!(cli.run.json);
    }

    #[test]
    fn targets_conflict_with_config() {
        let err = Cli::try_parse_from(["camswitch", "--config", "a.toml", "--targets", "2"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn rejects_bad_duration() {
        assert!(Cli::try_parse_from(["camswitch", "--duration", "whenever"]).is_err());
    }
}
