//! muxkv: send commands to a Redis-compatible server from the shell.
//!
//! Several `;`-separated commands are sent as one pipelined job.

mod config;

use anyhow::{bail, Context, Result};
use muxkv_client::{cmd, Arg, ClientPool, Cmd, Job, MuxClient, Reply, SyncedClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Mode, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if settings.commands.is_empty() {
        bail!("no command given, e.g. `muxkv SET k 1 ; GET k`");
    }
    let job = build_job(&settings.commands)?;
    info!(
        addr = %settings.client.addr(),
        mode = ?settings.mode,
        commands = job.command_count(),
        "sending"
    );

    let replies = match settings.mode {
        Mode::Mux => {
            let client = MuxClient::connect(settings.client, None).await.context("connecting")?;
            let job = client.execute(job).await;
            let _ = client.quit().await;
            job.into_result()?
        }
        Mode::Synced => {
            let mut client = SyncedClient::connect(settings.client, None).await.context("connecting")?;
            let job = client.execute(job).await;
            let _ = client.quit().await;
            job.into_result()?
        }
        Mode::Pool => {
            let pool = ClientPool::connect(settings.client, None).await.context("connecting")?;
            let mut rented = pool.rent().await.context("renting a client")?;
            let job = rented.execute(job).await;
            rented.release();
            let _ = pool.quit().await;
            job.into_result()?
        }
    };

    print_replies(&replies);
    Ok(())
}

fn build_job(commands: &[Vec<String>]) -> Result<Job> {
    let mut args = Vec::new();
    for words in commands {
        let Some((name, rest)) = words.split_first() else {
            continue;
        };
        let token = cmd::lookup(name)
            .cloned()
            .unwrap_or_else(|| Cmd::new(name.to_ascii_uppercase()));
        args.push(Arg::Cmd(token));
        args.extend(rest.iter().map(|word| Arg::from(word.as_str())));
    }
    Job::pipeline(args).context("building the command batch")
}

fn print_replies(replies: &[Reply]) {
    for reply in replies {
        println!("{}", reply);
    }
}
