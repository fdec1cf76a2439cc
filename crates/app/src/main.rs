mod app;
mod cli;
mod render;
mod settings;

use std::io;

use clap::Parser;
use murmur_stream::UiNotifier;
use snafu::ResultExt;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use crate::app::{App, AppError, OutputSnafu, RendererTaskSnafu, print_settings, save_settings};
use crate::cli::{Cli, Command};
use crate::render::TerminalRenderer;
use crate::settings::SettingsStore;

const DEFAULT_LOG_FILTER: &str = "murmur=info,murmur_stream=info,murmur_storage=info";

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Logs go to stderr so stdout only carries conversation text.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let settings_store = match &cli.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let settings = settings_store.apply_overrides(&cli.overrides());
    let command = cli.command.unwrap_or_default();

    if let Command::Config { save } = command {
        print_settings(&settings, &mut io::stdout().lock())?;
        if save {
            save_settings(&settings_store, &settings)?;
        }
        return Ok(());
    }

    let (notifier, events) = UiNotifier::channel();
    let renderer = tokio::spawn(TerminalRenderer::new(io::stdout(), io::stderr()).run(events));

    let app = App::open(settings, notifier).await?;
    let result = app
        .execute(command, BufReader::new(tokio::io::stdin()), &mut io::stdout())
        .await;
    // Dropping the app closes the event channel so the renderer can finish.
    drop(app);

    renderer
        .await
        .context(RendererTaskSnafu {
            stage: "join-renderer",
        })?
        .context(OutputSnafu {
            stage: "render-events",
        })?;
    result
}
