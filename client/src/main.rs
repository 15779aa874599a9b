//! notesync-replay - drive a sync session from a script of intents.
//!
//! Reads newline-delimited JSON intents from a file (or stdin), applies them
//! against an in-process loopback remote and prints every emitted event as a
//! JSON line on stdout. Logs go to stderr.
//!
//! ```text
//! notesync-replay intents.ndjson
//! echo '{"type":"create","id":"t1"}' | notesync-replay -
//! ```

use notesync_client::{
    Config, Coordinator, Intent, JsonFilePersistence, LoopbackRemote, Persistence,
};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notesync_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let settle = config.edit_debounce + std::time::Duration::from_millis(500);

    let persistence = config.state_path.as_ref().map(|path| {
        tracing::info!(path = %path.display(), "persisting sync state");
        Arc::new(JsonFilePersistence::new(path)) as Arc<dyn Persistence>
    });

    let (remote, remote_events) = LoopbackRemote::new();
    let (coordinator, mut events) = Coordinator::new(config, remote, persistence);
    coordinator.on_logout(|| tracing::info!("logged out"));
    let remote_loop = coordinator.spawn_remote_loop(remote_events);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!(error = %e, "could not encode event"),
            }
        }
    });

    coordinator.start().await?;

    let source = std::env::args().nth(1);
    let applied = match source.as_deref() {
        None | Some("-") => replay(&coordinator, BufReader::new(tokio::io::stdin())).await?,
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            replay(&coordinator, BufReader::new(file)).await?
        }
    };
    tracing::info!(intents = applied, "script finished, waiting for sync to settle");

    // Let debounced syncs fire and acknowledgments arrive
    tokio::time::sleep(settle).await;
    coordinator.shutdown().await?;

    remote_loop.abort();
    drop(coordinator);
    // The printer ends once the last coordinator handle is gone
    if tokio::time::timeout(std::time::Duration::from_secs(1), printer)
        .await
        .is_err()
    {
        tracing::warn!("event stream still open at exit");
    }
    Ok(())
}

/// Dispatch every intent line. Blank lines and `#` comments are skipped.
async fn replay<R>(coordinator: &Arc<Coordinator>, reader: R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut applied = 0;
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<Intent>(line) {
            Ok(intent) => {
                coordinator.dispatch(intent);
                applied += 1;
                // Give spawned network work a chance to run between intents
                tokio::task::yield_now().await;
            }
            Err(e) => tracing::warn!(line = line_no, error = %e, "skipping invalid intent"),
        }
    }
    Ok(applied)
}
