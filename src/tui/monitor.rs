//! Live view of a probe run fed by the dispatcher's observer channel

use crate::proxy::ProbeResult;
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum number of recent proxies to keep for display
const MAX_RECENT_PROXIES: usize = 100;

/// Probe monitor state
pub struct ProbeMonitor {
    results: mpsc::UnboundedReceiver<ProbeResult>,
    /// Cancelled when the user quits before the run is over
    cancel: Option<CancellationToken>,
    total: usize,
    checked: usize,
    good_count: usize,
    bad_count: usize,
    recent_good: VecDeque<ProbeResult>,
    recent_bad: VecDeque<ProbeResult>,
    /// Selected list (0 = good, 1 = bad)
    selected_list: usize,
    list_state: ListState,
    status_message: String,
    is_complete: bool,
    should_quit: bool,
}

impl ProbeMonitor {
    /// `total` is the number of addresses submitted to the dispatcher
    pub fn new(total: usize, results: mpsc::UnboundedReceiver<ProbeResult>) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            results,
            cancel: None,
            total,
            checked: 0,
            good_count: 0,
            bad_count: 0,
            recent_good: VecDeque::new(),
            recent_bad: VecDeque::new(),
            selected_list: 0,
            list_state,
            status_message: "Starting proxy test... Press 'q' to quit.".to_string(),
            is_complete: false,
            should_quit: false,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// Take over the terminal until the user quits
    pub async fn run(&mut self) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }

            self.drain();
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    /// Take every result available without blocking
    fn drain(&mut self) {
        loop {
            match self.results.try_recv() {
                Ok(result) => self.record(result),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.is_complete {
                        self.is_complete = true;
                        self.status_message = format!(
                            "Complete! Tested: {} | Working: {} | Failed: {} | Press 'q' to quit",
                            self.checked, self.good_count, self.bad_count
                        );
                    }
                    break;
                }
            }
        }
    }

    fn record(&mut self, result: ProbeResult) {
        self.checked += 1;

        let recent = if result.is_working {
            self.good_count += 1;
            &mut self.recent_good
        } else {
            self.bad_count += 1;
            &mut self.recent_bad
        };
        recent.push_back(result);
        if recent.len() > MAX_RECENT_PROXIES {
            recent.pop_front();
        }

        self.status_message = format!(
            "Testing... {}% ({}/{}) | Working: {} | Failed: {}",
            self.percent(),
            self.checked,
            self.total,
            self.good_count,
            self.bad_count
        );
    }

    fn percent(&self) -> u16 {
        if self.total == 0 {
            return 0;
        }
        (self.checked as f64 / self.total as f64 * 100.0).min(100.0) as u16
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
                if !self.is_complete {
                    if let Some(cancel) = &self.cancel {
                        cancel.cancel();
                    }
                }
            }
            KeyCode::Tab => {
                self.selected_list = (self.selected_list + 1) % 2;
                self.list_state.select(Some(0));
            }
            KeyCode::Down => {
                let len = self.selected().len();
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < len => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let len = self.selected().len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn selected(&self) -> &VecDeque<ProbeResult> {
        if self.selected_list == 0 {
            &self.recent_good
        } else {
            &self.recent_bad
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Proxy lists
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new("Proxy Validation")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let progress = self.percent();
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(progress)
            .label(format!("{}/{} ({}%)", self.checked, self.total, progress));
        f.render_widget(gauge, chunks[1]);

        let lists = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        render_results(
            f,
            lists[0],
            &format!("✓ Working ({})", self.good_count),
            &self.recent_good,
            Color::Green,
            (self.selected_list == 0).then_some(&mut self.list_state),
        );
        render_results(
            f,
            lists[1],
            &format!("✗ Failed ({})", self.bad_count),
            &self.recent_bad,
            Color::Red,
            (self.selected_list == 1).then_some(&mut self.list_state),
        );

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }
}

fn render_results(
    f: &mut Frame,
    area: Rect,
    title: &str,
    results: &VecDeque<ProbeResult>,
    color: Color,
    list_state: Option<&mut ListState>,
) {
    let items: Vec<ListItem> = results
        .iter()
        .rev()
        .map(|result| {
            let content = match &result.failure {
                None => format!("{} ({}ms)", result.address, result.latency_ms()),
                Some(failure) => format!("{} ({})", result.address, failure.kind()),
            };
            ListItem::new(content).style(Style::default().fg(color))
        })
        .collect();

    let border_style = if list_state.is_some() {
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title.to_string())
                .border_style(border_style),
        )
        .highlight_style(Style::default().bg(Color::DarkGray))
        .highlight_symbol(">> ");

    match list_state {
        Some(state) => f.render_stateful_widget(list, area, state),
        None => f.render_widget(list, area),
    }
}
