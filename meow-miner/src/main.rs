use meow_miner::config::Settings;
use meow_miner::daemon::{Daemon, Outcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    meow_miner::tracing::init_journald_or_stdout();

    let settings = Settings::from_env();
    let outcome = Daemon::new(settings).run().await?;

    match outcome {
        Outcome::Clean => Ok(()),
        Outcome::ConnectionsExhausted => std::process::exit(1),
    }
}
