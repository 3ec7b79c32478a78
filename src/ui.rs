use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use crate::app::{App, InputMode, Role};

/// Parse a line of text and convert **bold** markdown to styled spans
fn parse_markdown_line(text: &str) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut chars = text.char_indices().peekable();
    let mut current_text = String::new();

    while let Some((_, c)) = chars.next() {
        if c == '*' {
            // Check for ** (bold)
            if chars.peek().map(|(_, c)| *c) == Some('*') {
                // Consume the second *
                chars.next();

                // Push any accumulated plain text
                if !current_text.is_empty() {
                    spans.push(Span::raw(std::mem::take(&mut current_text)));
                }

                // Find closing **
                let mut bold_text = String::new();
                let mut found_close = false;

                while let Some((_, c)) = chars.next() {
                    if c == '*' && chars.peek().map(|(_, c)| *c) == Some('*') {
                        chars.next(); // consume second *
                        found_close = true;
                        break;
                    }
                    bold_text.push(c);
                }

                if found_close && !bold_text.is_empty() {
                    spans.push(Span::styled(
                        bold_text,
                        Style::default().add_modifier(Modifier::BOLD),
                    ));
                } else {
                    // No closing **, treat as literal
                    current_text.push_str("**");
                    current_text.push_str(&bold_text);
                }
            } else {
                current_text.push(c);
            }
        } else {
            current_text.push(c);
        }
    }

    if !current_text.is_empty() {
        spans.push(Span::raw(current_text));
    }

    if spans.is_empty() {
        Line::default()
    } else {
        Line::from(spans)
    }
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    // Main layout: header, chat, input, footer
    let [header_area, chat_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_chat(app, frame, chat_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);

    if app.show_attach_input {
        render_attach_input(app, frame, area);
    }
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let key_state = if app.gemini.is_some() {
        ""
    } else {
        " [no API key]"
    };

    let title = Line::from(vec![
        Span::styled(" gemchat ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(
            format!("{}{}", app.model, key_state),
            Style::default().fg(Color::DarkGray),
        ),
        Span::raw(" "),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    // Store chat area dimensions for scroll calculations (inner size minus borders)
    app.chat_height = area.height.saturating_sub(2);
    app.chat_width = area.width.saturating_sub(2);

    let border_color = if app.input_mode == InputMode::Normal {
        Color::Cyan
    } else {
        Color::DarkGray
    };
    let chat_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(format!(" Gemini: {} ", app.model));

    let mut lines: Vec<Line> = Vec::new();

    for msg in &app.messages {
        match msg.role {
            Role::User => {
                lines.push(Line::from(vec![
                    Span::styled(
                        "You:",
                        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                    ),
                    Span::styled(
                        format!("  {}", msg.timestamp.format("%H:%M")),
                        Style::default().fg(Color::DarkGray),
                    ),
                ]));
                if msg.image.is_some() {
                    lines.push(Line::from(Span::styled(
                        "[image]",
                        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
                    )));
                }
                lines.push(Line::from(msg.content.clone()));
                lines.push(Line::default());
            }
            Role::Assistant => {
                lines.push(Line::from(vec![
                    Span::styled(
                        "Gemini:",
                        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                    ),
                    Span::styled(
                        format!("  {}", msg.timestamp.format("%H:%M")),
                        Style::default().fg(Color::DarkGray),
                    ),
                ]));

                if msg.content.is_empty() && app.is_sending {
                    // Animated ellipsis: cycles through ".", "..", "..."
                    let dots = ".".repeat((app.animation_frame as usize) + 1);
                    lines.push(Line::from(Span::styled(
                        format!("Thinking{}", dots),
                        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
                    )));
                    lines.push(Line::default());
                    continue;
                }

                for line in msg.content.lines() {
                    lines.push(parse_markdown_line(line));
                }

                if !msg.sources.is_empty() {
                    lines.push(Line::from(Span::styled(
                        "Sources:",
                        Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
                    )));
                    for (i, source) in msg.sources.iter().enumerate() {
                        lines.push(Line::from(Span::styled(
                            format!(" {}. {} ({})", i + 1, source.title, source.uri),
                            Style::default().fg(Color::DarkGray),
                        )));
                    }
                }
                lines.push(Line::default());
            }
        }
    }

    let chat = Paragraph::new(Text::from(lines))
        .block(chat_block)
        .wrap(Wrap { trim: true })
        .scroll((app.chat_scroll, 0));

    frame.render_widget(chat, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let input_border_color = if app.input_mode == InputMode::Editing {
        Color::Yellow
    } else {
        Color::DarkGray
    };

    let title = if app.pending_image.is_some() {
        " Message [image attached] "
    } else {
        " Message "
    };
    let input_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(input_border_color))
        .title(title);

    // Calculate visible portion of input with horizontal scrolling
    // Inner width = total width - 2 (for borders)
    let inner_width = area.width.saturating_sub(2) as usize;
    let cursor_pos = app.input_cursor;

    // Calculate scroll offset to keep cursor visible
    let scroll_offset = if inner_width == 0 {
        0
    } else if cursor_pos >= inner_width {
        cursor_pos - inner_width + 1
    } else {
        0
    };

    let visible_text: String = app
        .input
        .chars()
        .skip(scroll_offset)
        .take(inner_width)
        .collect();

    let input = Paragraph::new(visible_text)
        .style(Style::default().fg(Color::Cyan))
        .block(input_block);

    frame.render_widget(input, area);

    // Show cursor when editing (but not under the attach popup)
    if app.input_mode == InputMode::Editing && !app.show_attach_input {
        let cursor_x = (cursor_pos - scroll_offset) as u16;
        frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
    }
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let mode_style = match app.input_mode {
        InputMode::Normal => Style::default().bg(Color::Blue).fg(Color::White),
        InputMode::Editing => Style::default().bg(Color::Yellow).fg(Color::Black),
    };

    let mode_text = match app.input_mode {
        InputMode::Normal => " CHAT ",
        InputMode::Editing => " TYPE ",
    };

    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let hints = match app.input_mode {
        InputMode::Normal => vec![
            Span::styled(" i ", key_style),
            Span::styled(" type ", label_style),
            Span::styled(" j/k ", key_style),
            Span::styled(" scroll ", label_style),
            Span::styled(" ^A ", key_style),
            Span::styled(" attach ", label_style),
            Span::styled(" ^L ", key_style),
            Span::styled(" clear ", label_style),
            Span::styled(" q ", key_style),
            Span::styled(" quit ", label_style),
        ],
        InputMode::Editing => {
            let mut hints = vec![
                Span::styled(" Enter ", key_style),
                Span::styled(" send ", label_style),
                Span::styled(" Esc ", key_style),
                Span::styled(" stop typing ", label_style),
                Span::styled(" ^A ", key_style),
                Span::styled(" attach ", label_style),
            ];
            if app.pending_image.is_some() {
                hints.extend(vec![
                    Span::styled(" ^X ", key_style),
                    Span::styled(" unattach ", label_style),
                ]);
            }
            hints.extend(vec![
                Span::styled(" ^L ", key_style),
                Span::styled(" clear ", label_style),
            ]);
            hints
        }
    };

    let footer_content = Line::from(
        vec![
            Span::styled(mode_text, mode_style),
            Span::styled(" ", label_style),
        ]
        .into_iter()
        .chain(hints)
        .collect::<Vec<_>>(),
    );

    let footer = Paragraph::new(footer_content).style(Style::default().bg(Color::Black));
    frame.render_widget(footer, area);
}

fn render_attach_input(app: &App, frame: &mut Frame, area: Rect) {
    // Calculate popup size and position (centered)
    let popup_width = 60.min(area.width.saturating_sub(4));
    let popup_height = 7;

    let popup_x = (area.width.saturating_sub(popup_width)) / 2;
    let popup_y = (area.height.saturating_sub(popup_height)) / 2;

    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height);

    // Clear the area behind the popup
    frame.render_widget(Clear, popup_area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Attach Image ");

    let inner = block.inner(popup_area);
    frame.render_widget(block, popup_area);

    // Instructions
    let instructions = Paragraph::new("Path to an image file. Enter to attach, Esc to cancel.")
        .style(Style::default().fg(Color::DarkGray));

    let instructions_area = Rect::new(inner.x, inner.y, inner.width, 1);
    frame.render_widget(instructions, instructions_area);

    // Input field
    let input_area = Rect::new(inner.x, inner.y + 2, inner.width, 1);
    let input = Paragraph::new(app.attach_input.as_str())
        .style(Style::default().fg(Color::Cyan));
    frame.render_widget(input, input_area);

    // Show cursor
    let cursor_x = app.attach_cursor.min(input_area.width as usize) as u16;
    frame.set_cursor_position((input_area.x + cursor_x, input_area.y));

    // Error line (file could not be read)
    if let Some(error) = &app.attach_error {
        let status = Paragraph::new(error.as_str()).style(Style::default().fg(Color::Red));
        let status_area = Rect::new(inner.x, inner.y + 4, inner.width, 1);
        frame.render_widget(status, status_area);
    }
}
