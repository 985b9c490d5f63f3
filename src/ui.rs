use crate::client::RcaClient;
use crate::ndjson::DecodeOutcome;
use crate::protocol::{ChatContext, ChatMessage, ChatRequest, Role, StreamEvent};
use crate::session::{ChatSession, SessionUpdate};
use crate::store::ChatStore;
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

// Streaming preview rows above the input box; together they form the
// inline viewport.
const PREVIEW_HEIGHT: u16 = 4;
const INPUT_HEIGHT: u16 = 6;

/// Raw mode for the lifetime of the chat panel, on every exit path.
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

/// A block printed into the scrollback above the inline viewport.
#[derive(Debug, Clone)]
enum Entry {
    Message(ChatMessage),
    Info(String),
    Error(String),
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

impl Entry {
    fn line_specs(&self) -> Vec<LineSpec> {
        match self {
            Entry::Message(message) => {
                let (label, color) = match message.role {
                    Role::User => ("You:", Color::Blue),
                    Role::Assistant => ("RCA Agent:", Color::Yellow),
                };
                let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
                let body_style = Style::default().fg(color);
                let mut lines = vec![LineSpec::new(label, header_style)];
                for line in message.content.lines() {
                    lines.push(LineSpec::new(format!("  {}", line), body_style));
                }
                lines
            }
            Entry::Info(msg) => vec![LineSpec::new(
                format!("ℹ {}", msg),
                Style::default()
                    .fg(Color::Gray)
                    .add_modifier(Modifier::ITALIC),
            )],
            Entry::Error(msg) => vec![LineSpec::new(
                format!("✗ {} (Ctrl+R to retry)", msg),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            )],
        }
    }

    fn to_text(&self) -> Text<'static> {
        let lines = self
            .line_specs()
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>();
        Text::from(lines)
    }

    fn rendered_height(&self, width: u16) -> u16 {
        let width = width.max(1) as usize;
        let total: usize = self
            .line_specs()
            .iter()
            .map(|spec| spec.text.chars().count().max(1).div_ceil(width))
            .sum();
        total as u16
    }
}

/// Progress of a streaming task, tagged with the session turn it serves.
#[derive(Debug)]
pub enum UiEvent {
    Stream { turn: u64, event: StreamEvent },
    Finished { turn: u64, outcome: DecodeOutcome },
    Failed { turn: u64, message: String },
}

struct InputBuffer {
    lines: Vec<String>,
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn insert_char(&mut self, c: char) {
        let line = &mut self.lines[self.cursor_y];
        let at = byte_offset(line, self.cursor_x);
        line.insert(at, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            let line = &mut self.lines[self.cursor_y];
            let at = byte_offset(line, self.cursor_x - 1);
            line.remove(at);
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            let removed = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.lines[self.cursor_y].chars().count();
            self.lines[self.cursor_y].push_str(&removed);
        }
    }

    fn new_line(&mut self) {
        let line = &self.lines[self.cursor_y];
        let remaining: String = line.chars().skip(self.cursor_x).collect();
        self.lines[self.cursor_y] = line.chars().take(self.cursor_x).collect();
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len();
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len() {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn line_len(&self) -> usize {
        self.lines[self.cursor_y].chars().count()
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                "Ask about this incident...",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

fn byte_offset(line: &str, chars: usize) -> usize {
    line.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(line.len())
}

pub struct App {
    session: ChatSession,
    store: ChatStore,
    client: Arc<RcaClient>,
    input: InputBuffer,
    sender: mpsc::Sender<UiEvent>,
    receiver: mpsc::Receiver<UiEvent>,
    cancel: Option<CancellationToken>,
    // How many session messages are already in the scrollback.
    printed: usize,
}

impl App {
    pub fn new(client: RcaClient, store: ChatStore, session: ChatSession) -> Self {
        let (sender, receiver) = mpsc::channel(256);

        Self {
            session,
            store,
            client: Arc::new(client),
            input: InputBuffer::new(),
            sender,
            receiver,
            cancel: None,
            printed: 0,
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(PREVIEW_HEIGHT),
                Constraint::Length(INPUT_HEIGHT),
            ])
            .split(f.area());

        f.render_widget(self.preview(chunks[0].height), chunks[0]);

        let title = if self.session.is_streaming() {
            " Input (Esc to stop) [Streaming...] "
        } else {
            " Input (Enter to send, Ctrl+L to clear, Esc to quit) "
        };
        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });

        let area = chunks[1];
        f.render_widget(input_paragraph, area);

        let cursor_x = (self.input.cursor_x + 1) as u16;
        let cursor_y = self.input.cursor_y as u16;
        let x = (area.x + cursor_x).min(area.x + area.width - 2);
        let y = (area.y + 1 + cursor_y).min(area.y + area.height - 2);
        f.set_cursor_position((x, y));
    }

    // Live view of the in-flight reply: status label plus the newest lines.
    fn preview(&self, height: u16) -> Paragraph<'static> {
        if !self.session.is_streaming() {
            return Paragraph::new("");
        }

        let status = self.session.status().unwrap_or("Thinking...");
        let mut lines = vec![Line::from(Span::styled(
            format!("⋯ {}", status),
            Style::default()
                .fg(Color::Green)
                .add_modifier(Modifier::ITALIC),
        ))];

        let keep = height.saturating_sub(1) as usize;
        let partial: Vec<&str> = self.session.partial().lines().collect();
        let start = partial.len().saturating_sub(keep);
        lines.extend(partial[start..].iter().map(|line| {
            Line::from(Span::styled(
                format!("  {}", line),
                Style::default().fg(Color::Yellow),
            ))
        }));

        Paragraph::new(Text::from(lines)).wrap(Wrap { trim: false })
    }

    fn append_entry(&mut self, terminal: &mut TuiTerminal, entry: Entry) -> UiResult<()> {
        let width = terminal.size()?.width;
        let height = entry.rendered_height(width).saturating_add(1);
        let mut text = entry.to_text();
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
            paragraph.render(buf.area, buf);
        })?;
        Ok(())
    }

    fn print_new_messages(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        let pending: Vec<ChatMessage> = self.session.messages()[self.printed..].to_vec();
        self.printed = self.session.messages().len();
        for message in pending {
            self.append_entry(terminal, Entry::Message(message))?;
        }
        Ok(())
    }

    // Saves history and prints whatever the session finalized.
    fn settle(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        self.print_new_messages(terminal)?;
        if let Err(err) = self
            .store
            .save(self.session.report_id(), self.session.messages())
        {
            tracing::warn!(error = %err, "failed to save chat history");
            self.append_entry(terminal, Entry::Info(format!("History not saved: {}", err)))?;
        }
        Ok(())
    }

    // Must be called right after the session opened a turn; the task's
    // events are tagged with that turn.
    fn start_stream(&mut self, request: ChatRequest) {
        self.stop_stream();
        let turn = self.session.turn();
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let client = Arc::clone(&self.client);
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = client
                .stream_chat(&request, &cancel, |event| {
                    let sender = sender.clone();
                    async move {
                        let _ = sender.send(UiEvent::Stream { turn, event }).await;
                    }
                })
                .await;

            let event = match result {
                Ok(outcome) => UiEvent::Finished { turn, outcome },
                Err(err) => UiEvent::Failed {
                    turn,
                    message: err.to_string(),
                },
            };
            let _ = sender.send(event).await;
        });
    }

    fn stop_stream(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }

    fn handle_ui_event(&mut self, terminal: &mut TuiTerminal, event: UiEvent) -> UiResult<()> {
        match event {
            UiEvent::Stream { turn, event } => match self.session.apply(turn, &event) {
                SessionUpdate::Completed => self.settle(terminal)?,
                SessionUpdate::Failed => {
                    let message = self.session.error().unwrap_or_default().to_string();
                    self.append_entry(terminal, Entry::Error(message))?;
                }
                SessionUpdate::Chunk | SessionUpdate::Status | SessionUpdate::Ignored => {}
            },
            UiEvent::Finished { turn, outcome } => {
                if turn != self.session.turn() {
                    return Ok(());
                }
                self.cancel = None;
                let was_streaming = self.session.is_streaming();
                self.session.finish(turn, outcome);
                self.settle(terminal)?;
                if was_streaming && outcome == DecodeOutcome::Cancelled {
                    self.append_entry(terminal, Entry::Info("Response stopped".to_string()))?;
                }
            }
            UiEvent::Failed { turn, message } => {
                if turn != self.session.turn() {
                    return Ok(());
                }
                self.cancel = None;
                self.session.fail(turn, message.clone());
                self.append_entry(terminal, Entry::Error(message))?;
            }
        }
        Ok(())
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<bool> {
        while let Ok(event) = self.receiver.try_recv() {
            self.handle_ui_event(terminal, event)?;
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.modifiers.contains(KeyModifiers::CONTROL) {
                    match key.code {
                        KeyCode::Char('c') => {
                            self.stop_stream();
                            return Ok(false);
                        }
                        KeyCode::Char('l') if !self.session.is_streaming() => {
                            self.session.clear();
                            self.printed = 0;
                            if let Err(err) = self.store.clear(self.session.report_id()) {
                                tracing::warn!(error = %err, "failed to clear chat history");
                            }
                            self.append_entry(terminal, Entry::Info("History cleared".to_string()))?;
                        }
                        KeyCode::Char('r') => {
                            if let Some(request) = self.session.retry_request() {
                                self.append_entry(terminal, Entry::Info("Retrying...".to_string()))?;
                                self.start_stream(request);
                            }
                        }
                        _ => {}
                    }
                    return Ok(true);
                }

                match key.code {
                    KeyCode::Esc => {
                        if self.session.is_streaming() {
                            self.stop_stream();
                        } else {
                            return Ok(false);
                        }
                    }
                    KeyCode::Enter => {
                        if key.modifiers.contains(KeyModifiers::SHIFT) {
                            self.input.new_line();
                        } else if !self.session.is_streaming() {
                            let msg = self.input.text();
                            if !msg.trim().is_empty() {
                                self.input.clear();
                                let request = self.session.begin_user_turn(msg);
                                self.settle(terminal)?;
                                self.start_stream(request);
                            }
                        }
                    }
                    KeyCode::Char(c) => {
                        self.input.insert_char(c);
                    }
                    KeyCode::Backspace => {
                        self.input.delete_char();
                    }
                    KeyCode::Left => {
                        self.input.move_left();
                    }
                    KeyCode::Right => {
                        self.input.move_right();
                    }
                    KeyCode::Home => {
                        self.input.cursor_x = 0;
                    }
                    KeyCode::End => {
                        self.input.cursor_x = self.input.line_len();
                    }
                    _ => {}
                }
            }
        }

        Ok(true)
    }
}

pub fn run_tui(client: RcaClient, store: ChatStore, context: ChatContext) -> UiResult<()> {
    let history = store.load(&context.report_id)?;
    let mut app = App::new(client, store, ChatSession::new(context, history));

    let _raw = RawMode::enable()?;
    let mut terminal = inline_terminal()?;

    let banner = format!(
        "RCA chat for report {} via {}",
        app.session.report_id(),
        app.client.base_url()
    );
    app.append_entry(&mut terminal, Entry::Info(banner))?;
    app.print_new_messages(&mut terminal)?;

    loop {
        terminal.draw(|f| app.draw(f))?;
        if !app.handle_events(&mut terminal)? {
            break;
        }
    }

    Ok(())
}

// Scrolls the current screen up so the panel starts on a blank area
// without wiping what the user had on screen.
fn inline_terminal() -> UiResult<TuiTerminal> {
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    for _ in 0..rows {
        writeln!(stdout)?;
    }
    execute!(stdout, MoveTo(0, 0))?;

    let terminal = Terminal::with_options(
        CrosstermBackend::new(stdout),
        TerminalOptions {
            viewport: Viewport::Inline(PREVIEW_HEIGHT + INPUT_HEIGHT),
        },
    )?;
    Ok(terminal)
}
