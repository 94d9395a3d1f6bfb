mod renderfns;
mod views;

use crate::app::App;
use ratatui::prelude::*;

/// Main draw function
pub fn draw(frame: &mut Frame, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Length(1), // Header with sync indicator
      Constraint::Min(1),    // Queue items
      Constraint::Length(1), // Footer
    ])
    .split(frame.area());

  let now = app.now();

  renderfns::draw_header(
    frame,
    chunks[0],
    app.remote_url(),
    renderfns::sync_indicator(app.stats(), now),
  );
  views::draw_queue(
    frame,
    chunks[1],
    app.items(),
    app.selected(),
    now,
    app.is_draining(),
  );
  renderfns::draw_footer(frame, chunks[2], app.message());
}
