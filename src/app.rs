use crate::clock::Clock;
use crate::event::{Event, EventHandler};
use crate::queue::{OfflineMutationQueue, QueueItem, QueueStats};
use crate::ui;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
  disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use std::io::{stdout, Stdout};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One-line feedback shown in the footer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  pub text: String,
  pub is_error: bool,
}

/// Terminal status view over the offline queue
pub struct App {
  queue: Arc<OfflineMutationQueue>,
  clock: Arc<dyn Clock>,
  remote_url: String,

  /// Snapshot refreshed on every tick
  items: Vec<QueueItem>,
  stats: QueueStats,
  selected: usize,

  message: Option<Message>,
  draining: bool,

  /// Sender for drain results; set once the event loop starts
  event_tx: Option<mpsc::UnboundedSender<Event>>,

  should_quit: bool,
}

impl App {
  pub fn new(queue: Arc<OfflineMutationQueue>, clock: Arc<dyn Clock>, remote_url: String) -> Self {
    let mut app = Self {
      queue,
      clock,
      remote_url,
      items: Vec::new(),
      stats: QueueStats::default(),
      selected: 0,
      message: None,
      draining: false,
      event_tx: None,
      should_quit: false,
    };
    app.refresh();
    app
  }

  pub async fn run(&mut self) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let mut events = EventHandler::new(Duration::from_millis(500));
    self.event_tx = Some(events.sender());

    let result = self.event_loop(&mut terminal, &mut events).await;

    // Cleanup terminal even when drawing failed
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
  }

  async fn event_loop(
    &mut self,
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    events: &mut EventHandler,
  ) -> Result<()> {
    while !self.should_quit {
      terminal.draw(|frame| ui::draw(frame, self))?;

      match events.next().await {
        Some(event) => self.handle_event(event),
        None => break,
      }
    }
    Ok(())
  }

  pub fn handle_event(&mut self, event: Event) {
    match event {
      Event::Key(key) => self.handle_key(key),
      Event::Tick => self.refresh(),
      Event::Drained(report) => {
        self.draining = false;
        self.refresh();
        self.set_message(
          format!(
            "Drain finished: {} sent, {} retrying, {} failed{}",
            report.sent,
            report.retried,
            report.failed,
            if report.skipped_offline { " (offline)" } else { "" }
          ),
          report.failed > 0,
        );
      }
    }
  }

  pub fn handle_key(&mut self, key: KeyEvent) {
    match key.code {
      KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
      KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
        self.should_quit = true;
      }
      KeyCode::Char('j') | KeyCode::Down => {
        if self.selected + 1 < self.items.len() {
          self.selected += 1;
        }
      }
      KeyCode::Char('k') | KeyCode::Up => {
        self.selected = self.selected.saturating_sub(1);
      }
      KeyCode::Char('r') => self.retry_failed(),
      KeyCode::Char('p') => self.start_drain(),
      KeyCode::Char('d') => self.remove_selected(),
      KeyCode::Char('C') => self.clear_all(),
      _ => {}
    }
  }

  fn retry_failed(&mut self) {
    match self.queue.requeue_failed() {
      Ok(0) => self.set_message("No failed items".to_string(), false),
      Ok(count) => self.set_message(format!("Re-queued {} failed items", count), false),
      Err(e) => self.set_message(format!("Retry failed: {}", e), true),
    }
    self.refresh();
  }

  fn start_drain(&mut self) {
    if self.draining {
      return;
    }
    let Some(tx) = self.event_tx.clone() else {
      return;
    };
    self.draining = true;
    self.set_message("Draining...".to_string(), false);

    let queue = Arc::clone(&self.queue);
    tokio::spawn(async move {
      let report = queue.process().await;
      let _ = tx.send(Event::Drained(report));
    });
  }

  fn remove_selected(&mut self) {
    let Some(item) = self.items.get(self.selected) else {
      return;
    };
    let id = item.id.clone();
    match self.queue.remove(&id) {
      Ok(true) => self.set_message(format!("Removed {}", id), false),
      Ok(false) => {}
      Err(e) => self.set_message(format!("Remove failed: {}", e), true),
    }
    self.refresh();
  }

  fn clear_all(&mut self) {
    match self.queue.clear() {
      Ok(()) => self.set_message("Queue cleared".to_string(), false),
      Err(e) => self.set_message(format!("Clear failed: {}", e), true),
    }
    self.refresh();
  }

  fn refresh(&mut self) {
    self.items = self.queue.items();
    self.stats = self.queue.stats();
    if self.selected >= self.items.len() {
      self.selected = self.items.len().saturating_sub(1);
    }
  }

  fn set_message(&mut self, text: String, is_error: bool) {
    self.message = Some(Message { text, is_error });
  }

  pub fn items(&self) -> &[QueueItem] {
    &self.items
  }

  pub fn stats(&self) -> &QueueStats {
    &self.stats
  }

  pub fn selected(&self) -> usize {
    self.selected
  }

  pub fn message(&self) -> Option<&Message> {
    self.message.as_ref()
  }

  pub fn is_draining(&self) -> bool {
    self.draining
  }

  pub fn remote_url(&self) -> &str {
    &self.remote_url
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn should_quit(&self) -> bool {
    self.should_quit
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::queue::{
    Connectivity, Method, MutationSender, Operation, ProcessReport, QueueConfig, QueueStatus,
  };
  use crate::store::MemoryStore;
  use color_eyre::eyre::eyre;
  use futures::future::{BoxFuture, FutureExt};

  struct Rejecting;

  impl MutationSender for Rejecting {
    fn send<'a>(&'a self, _operation: &'a Operation) -> BoxFuture<'a, Result<()>> {
      async { Err(eyre!("503 Service Unavailable")) }.boxed()
    }
  }

  fn key(code: KeyCode) -> KeyEvent {
    KeyEvent::new(code, KeyModifiers::NONE)
  }

  fn app_with(count: usize) -> (App, Arc<OfflineMutationQueue>) {
    let clock = ManualClock::default();
    let config = QueueConfig {
      max_attempts: 1,
      ..QueueConfig::default()
    };
    let queue = Arc::new(
      OfflineMutationQueue::open(
        Arc::new(MemoryStore::new()),
        Arc::new(Rejecting),
        Connectivity::always_online(),
        config,
      )
      .with_clock(Arc::new(clock.clone())),
    );
    for i in 0..count {
      queue
        .enqueue(Operation::new(format!("quests:{}", i), Method::Post, "rest/v1/quests"))
        .unwrap();
    }
    let app = App::new(Arc::clone(&queue), Arc::new(clock), "http://localhost:54321/".into());
    (app, queue)
  }

  #[test]
  fn test_navigation_stays_in_bounds() {
    let (mut app, _queue) = app_with(2);

    app.handle_key(key(KeyCode::Char('k')));
    assert_eq!(app.selected(), 0);
    app.handle_key(key(KeyCode::Char('j')));
    app.handle_key(key(KeyCode::Char('j')));
    assert_eq!(app.selected(), 1);
  }

  #[tokio::test]
  async fn test_retry_key_requeues_failed_items() {
    let (mut app, queue) = app_with(2);
    queue.process().await;
    app.handle_event(Event::Tick);
    assert_eq!(app.stats().failed, 2);

    app.handle_key(key(KeyCode::Char('r')));

    assert_eq!(app.stats().failed, 0);
    assert_eq!(app.stats().pending, 2);
    assert!(app.items().iter().all(|item| item.status == QueueStatus::Pending));
    assert_eq!(app.message().map(|m| m.text.as_str()), Some("Re-queued 2 failed items"));
  }

  #[test]
  fn test_remove_and_clear() {
    let (mut app, queue) = app_with(3);

    app.handle_key(key(KeyCode::Char('j')));
    app.handle_key(key(KeyCode::Char('d')));
    assert_eq!(queue.stats().total, 2);
    assert_eq!(app.items().len(), 2);

    app.handle_key(key(KeyCode::Char('C')));
    assert_eq!(queue.stats().total, 0);
    assert_eq!(app.selected(), 0);
  }

  #[test]
  fn test_drained_event_reports_failures() {
    let (mut app, _queue) = app_with(0);

    app.handle_event(Event::Drained(ProcessReport {
      sent: 1,
      retried: 0,
      failed: 2,
      skipped_offline: false,
    }));

    let message = app.message().unwrap();
    assert!(message.is_error);
    assert!(message.text.contains("2 failed"));
    assert!(!app.is_draining());
  }

  #[test]
  fn test_quit_keys() {
    let (mut app, _queue) = app_with(0);
    assert!(!app.should_quit());
    app.handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL));
    assert!(app.should_quit());
  }
}
