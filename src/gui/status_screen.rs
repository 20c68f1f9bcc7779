use std::{
    fmt::Display,
    io::stdout,
    sync::mpsc,
    thread::spawn,
    time::Duration,
};

use crate::gui::error::GuiError;

use crossterm::{
    event::{self, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};

use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// Runs `step` on a worker thread until the user presses a key, showing the
/// state after each step.
///
/// `init` is the starting state. Every call to `step` updates it in place,
/// and its [`Display`] text is what the screen shows. Once a key is
/// pressed the worker finishes its current step and the final state is
/// handed back.
pub fn run_until_keypress<F, T>(title: &str, init: T, mut step: F) -> Result<T, GuiError>
where
    F: FnMut(&mut T) + Send + 'static,
    T: Display + Send + 'static,
{
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let (status_tx, status_rx) = mpsc::channel::<String>();
    let (res_tx, res_rx) = mpsc::channel();

    let worker = spawn(move || {
        let mut state = init;
        loop {
            step(&mut state);
            let _ = status_tx.send(state.to_string());
            if stop_rx.try_recv().is_ok() {
                break;
            }
        }
        let _ = res_tx.send(state);
    });

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let shown = show_until_keypress(title, &status_rx);
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    stop_tx.send(())?;
    let result = res_rx.recv();
    worker.join().map_err(|_| GuiError::WorkerPanicked)?;
    shown?;
    Ok(result?)
}

fn show_until_keypress(title: &str, status_rx: &mpsc::Receiver<String>) -> Result<(), GuiError> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut status = String::new();
    loop {
        if let Some(latest) = status_rx.try_iter().last() {
            status = latest;
        }

        let title = Title::from(Span::from(format!(" {title} ")).magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Stop ".into(),
            "<Any key> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let text = Paragraph::new(status.as_str()).block(block);
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_widget(text, area);
        })?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(());
                }
            }
        }
    }
}
