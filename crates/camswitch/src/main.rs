mod cli;
mod producer;
mod run;

use anyhow::Result;
use cli::Command;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Some(Command::SampleConfig) => {
            print!("{}", muxconfig::SAMPLE_CONFIG);
            Ok(())
        }
        None => run::run(cli.run),
    }
}
