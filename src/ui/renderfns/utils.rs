use chrono::{DateTime, Utc};
use ratatui::prelude::{Color, Span, Style, Stylize};

use crate::queue::{QueueStats, QueueStatus};

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

/// Get the display color for a queue item status
pub fn status_color(status: QueueStatus) -> Color {
  match status {
    QueueStatus::Pending => Color::White,
    QueueStatus::Retrying => Color::Yellow,
    QueueStatus::Failed => Color::Red,
  }
}

/// Compact age: `42s`, `3m`, `5h`, `2d`
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
  let secs = (now - since).num_seconds().max(0);
  match secs {
    s if s < 60 => format!("{}s", s),
    s if s < 3_600 => format!("{}m", s / 60),
    s if s < 86_400 => format!("{}h", s / 3_600),
    s => format!("{}d", s / 86_400),
  }
}

/// "N pending (oldest Xs)" and "N failed", or "synced" when the queue is empty
pub fn sync_indicator(stats: &QueueStats, now: DateTime<Utc>) -> Vec<Span<'static>> {
  let unsent = stats.pending + stats.retrying;
  let mut spans = Vec::new();

  if unsent > 0 {
    let age = stats
      .oldest_item
      .map(|oldest| format!(" (oldest {})", format_age(oldest, now)))
      .unwrap_or_default();
    spans.push(Span::styled(
      format!("{} pending{}", unsent, age),
      Style::default().fg(Color::Yellow),
    ));
  }

  if stats.failed > 0 {
    if !spans.is_empty() {
      spans.push(Span::styled("  ", Style::default()));
    }
    spans.push(Span::styled(
      format!("{} failed", stats.failed),
      Style::default().fg(Color::Red).bold(),
    ));
  }

  if spans.is_empty() {
    spans.push(Span::styled("synced", Style::default().fg(Color::Green)));
  }
  spans
}
