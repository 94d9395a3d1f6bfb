use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

use crate::app::Message;

const HINTS: &[(&str, &str)] = &[
  ("j/k", "nav"),
  ("p", "drain"),
  ("r", "retry failed"),
  ("d", "remove"),
  ("C", "clear"),
  ("q", "quit"),
];

/// Draw the footer: the last action's message, or key hints
pub fn draw_footer(frame: &mut Frame, area: Rect, message: Option<&Message>) {
  let line = match message {
    Some(message) => {
      let color = if message.is_error { Color::Red } else { Color::Green };
      Line::from(Span::styled(
        format!(" {}", message.text),
        Style::default().fg(color),
      ))
    }
    None => {
      let mut spans = vec![Span::raw(" ")];
      for (key, label) in HINTS {
        spans.push(Span::styled(format!("<{}>", key), Style::default().fg(Color::Cyan)));
        spans.push(Span::styled(
          format!(" {}   ", label),
          Style::default().fg(Color::DarkGray),
        ));
      }
      Line::from(spans)
    }
  };

  let paragraph = Paragraph::new(line).style(Style::default().bg(Color::Black));

  frame.render_widget(paragraph, area);
}
