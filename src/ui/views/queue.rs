use chrono::{DateTime, Utc};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};

use crate::queue::QueueItem;
use crate::ui::renderfns::{format_age, status_color, truncate};

pub fn draw_queue(
  frame: &mut Frame,
  area: Rect,
  items: &[QueueItem],
  selected: usize,
  now: DateTime<Utc>,
  draining: bool,
) {
  let title = if draining {
    format!(" Offline queue ({}) (draining...) ", items.len())
  } else {
    format!(" Offline queue ({}) ", items.len())
  };

  let block = Block::default()
    .title(title)
    .borders(Borders::ALL)
    .border_style(Style::default().fg(Color::Blue));

  if items.is_empty() {
    let paragraph = Paragraph::new("Nothing waiting to sync.")
      .block(block)
      .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(paragraph, area);
    return;
  }

  let rows: Vec<ListItem> = items
    .iter()
    .map(|item| {
      let status = format!("{:?}", item.status).to_lowercase();
      let mut spans = vec![
        Span::styled(
          format!("{:<8}", status),
          Style::default().fg(status_color(item.status)),
        ),
        Span::raw(" "),
        Span::styled(
          format!("{:<6}", item.operation.method),
          Style::default().fg(Color::Cyan),
        ),
        Span::raw(" "),
        Span::raw(format!("{:<40}", truncate(&item.operation.path, 40))),
        Span::styled(
          format!(" {:>4} ", format_age(item.created_at, now)),
          Style::default().fg(Color::DarkGray),
        ),
        Span::styled(
          format!("x{}", item.attempts),
          Style::default().fg(Color::DarkGray),
        ),
      ];
      if let Some(error) = &item.last_error {
        spans.push(Span::styled(
          format!("  {}", truncate(error, 50)),
          Style::default().fg(Color::Red),
        ));
      }
      ListItem::new(Line::from(spans))
    })
    .collect();

  let list = List::new(rows)
    .block(block)
    .highlight_style(
      Style::default()
        .bg(Color::DarkGray)
        .add_modifier(Modifier::BOLD),
    )
    .highlight_symbol("> ");

  let mut state = ListState::default();
  state.select(Some(selected));

  frame.render_stateful_widget(list, area, &mut state);
}
