use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

/// Draw the header bar with logo, remote host, and the sync indicator
pub fn draw_header(frame: &mut Frame, area: Rect, remote_url: &str, indicator: Vec<Span<'static>>) {
  let domain = extract_domain(remote_url);

  let mut spans = vec![
    Span::styled(" questsync ", Style::default().fg(Color::Cyan).bold()),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(format!(" {} ", domain), Style::default().fg(Color::White)),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::raw(" "),
  ];
  spans.extend(indicator);

  let paragraph = Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::Black));

  frame.render_widget(paragraph, area);
}

/// Extract host (and port) from the remote URL
fn extract_domain(url: &str) -> &str {
  url
    .strip_prefix("https://")
    .or_else(|| url.strip_prefix("http://"))
    .unwrap_or(url)
    .split('/')
    .next()
    .unwrap_or(url)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_extract_domain() {
    assert_eq!(
      extract_domain("https://abc.supabase.co/rest/v1"),
      "abc.supabase.co"
    );
    assert_eq!(extract_domain("http://localhost:54321/"), "localhost:54321");
    assert_eq!(extract_domain("sync.example.com"), "sync.example.com");
  }
}
