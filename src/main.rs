use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod app;
mod config;
mod gemini;
mod handler;
mod tui;
mod ui;

use app::App;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    tui::install_panic_hook();

    let mut terminal = tui::init()?;
    let mut events = tui::EventHandler::new();
    let mut app = App::new()?;

    let result = run(&mut terminal, &mut app, &mut events).await;

    tui::restore()?;
    result
}

async fn run(terminal: &mut tui::Tui, app: &mut App, events: &mut tui::EventHandler) -> Result<()> {
    let tx = events.sender();
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;
        match events.next().await {
            Some(event) => handler::handle_event(app, event, &tx)?,
            None => break,
        }
    }
    Ok(())
}

/// The TUI owns stderr, so diagnostics go to a log file next to the config.
fn init_logging() -> Result<()> {
    let log_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("gemchat");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("gemchat.log"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gemchat=info")),
        )
        .with_writer(std::sync::Arc::new(log_file))
        .with_ansi(false)
        .init();

    Ok(())
}
