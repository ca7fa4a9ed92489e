use std::sync::Arc;

use fold::app::{ChatShell, TerminalRenderer};
use fold::chat::StreamController;
use fold::settings::SettingsStore;
use fold_llm::RigBackend;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Logs go to stderr so they never interleave with streamed replies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = SettingsStore::load();
    let snapshot = settings.settings();
    tracing::info!(
        config_path = ?settings.config_path(),
        model_name = %snapshot.model_name,
        "starting chat shell"
    );

    let backend = Arc::new(RigBackend::new(snapshot.to_provider_config()));
    let mut controller =
        StreamController::new(backend).with_turn_timeout(snapshot.turn_timeout());
    controller
        .store_mut()
        .subscribe(TerminalRenderer::new(std::io::stdout()));

    let mut shell = ChatShell::new(controller, settings);
    if let Err(error) = shell
        .run(BufReader::new(tokio::io::stdin()), std::io::stderr())
        .await
    {
        tracing::error!(error = %error, "chat shell stopped");
        std::process::exit(1);
    }
}
