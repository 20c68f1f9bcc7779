use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use std::{
    collections::VecDeque,
    error::Error,
    io,
    time::{Duration, Instant},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    style::{Color, Style},
    symbols,
    text::Span,
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType},
    Frame, Terminal,
};

use stroke_relay::{output_processor::OutputStrategy, pipeline::PipelineOutput};

/// Seconds of history on screen.
const WINDOW: f64 = 10.0;

struct App {
    output: PipelineOutput,
    strategy: OutputStrategy,
    raw: VecDeque<(f64, f64)>,
    processed: VecDeque<(f64, f64)>,
    now: f64,
}

impl App {
    fn new(output: PipelineOutput, strategy: OutputStrategy) -> App {
        App {
            output,
            strategy,
            raw: VecDeque::new(),
            processed: VecDeque::new(),
            now: 0.0,
        }
    }

    fn on_tick(&mut self) {
        for point in self.output.samples.try_iter() {
            let t = point.time.as_secs_f64();
            self.now = self.now.max(t);
            self.raw.push_back((t, point.position));
        }
        for event in self.output.events.try_iter() {
            let t = event.at.as_secs_f64();
            self.now = self.now.max(t);
            self.processed.push_back((t, event.position));
        }

        let oldest = self.now - WINDOW;
        for series in [&mut self.raw, &mut self.processed] {
            while series.front().is_some_and(|&(t, _)| t < oldest) {
                series.pop_front();
            }
        }
    }
}

pub fn engage_gui(output: PipelineOutput, strategy: OutputStrategy) -> Result<(), Box<dyn Error>> {
    // setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let tick_rate = Duration::from_millis(50);
    let app = App::new(output, strategy);
    let res = run_app(&mut terminal, app, tick_rate);

    // restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res.map_err(Into::into)
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    mut app: App,
    tick_rate: Duration,
) -> io::Result<()> {
    let mut last_tick = Instant::now();
    loop {
        terminal.draw(|f| ui(f, &mut app))?;

        let timeout = tick_rate.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if let KeyCode::Char('q') | KeyCode::Esc = key.code {
                    return Ok(());
                }
            }
        }
        if last_tick.elapsed() >= tick_rate {
            app.on_tick();
            last_tick = Instant::now();
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let raw: Vec<(f64, f64)> = app.raw.iter().copied().collect();
    let processed: Vec<(f64, f64)> = app.processed.iter().copied().collect();
    let start = (app.now - WINDOW).max(0.0);
    let end = start + WINDOW;

    let chart = Chart::new(vec![
        Dataset::default()
            .name("Estimated")
            .marker(symbols::Marker::Dot)
            .graph_type(GraphType::Scatter)
            .style(Style::default().fg(Color::Cyan))
            .data(&raw),
        Dataset::default()
            .name(format!("Sent ({})", app.strategy))
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Magenta))
            .data(&processed),
    ])
    .block(
        Block::default()
            .title(" Stroke position, <Q> to quit ")
            .borders(Borders::ALL),
    )
    .x_axis(
        Axis::default()
            .title(Span::styled("Seconds", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds([start, end])
            .labels(vec![
                Span::from(format!("{start:.0}")),
                Span::from(format!("{end:.0}")),
            ]),
    )
    .y_axis(
        Axis::default()
            .title(Span::styled("Position", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds([0.0, 1.0])
            .labels(["0.0", "0.5", "1.0"].iter().cloned().map(Span::from).collect()),
    );

    f.render_widget(chart, f.size());
}
