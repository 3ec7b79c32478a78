use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseEvent, MouseEventKind};
use tokio::sync::mpsc::UnboundedSender;

use crate::app::{App, ChatEvent, InputMode};
use crate::gemini;
use crate::tui::AppEvent;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

pub fn handle_event(app: &mut App, event: AppEvent, tx: &UnboundedSender<AppEvent>) -> Result<()> {
    match event {
        AppEvent::Key(key) => handle_key(app, key, tx),
        AppEvent::Mouse(mouse) => handle_mouse(app, mouse),
        AppEvent::Resize(_, _) => {}
        AppEvent::Tick => app.tick_animation(),
        AppEvent::Chat(chat_event) => app.apply_chat_event(chat_event),
    }
    Ok(())
}

fn handle_key(app: &mut App, key: KeyEvent, tx: &UnboundedSender<AppEvent>) {
    // Global keys that work in any mode
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.should_quit = true;
        return;
    }

    if app.show_attach_input {
        handle_attach_input(app, key);
        return;
    }

    match app.input_mode {
        InputMode::Normal => handle_normal_mode(app, key),
        InputMode::Editing => handle_editing_mode(app, key, tx),
    }
}

fn handle_normal_mode(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Char('q') => app.should_quit = true,

        // Chat scrolling
        KeyCode::Char('j') | KeyCode::Down => app.scroll_down(),
        KeyCode::Char('k') | KeyCode::Up => app.scroll_up(),
        KeyCode::Char('g') => app.chat_scroll = 0,
        KeyCode::Char('G') => app.scroll_chat_to_bottom(),

        // Back to typing
        KeyCode::Char('i') | KeyCode::Tab | KeyCode::Enter => {
            app.input_mode = InputMode::Editing;
            app.input_cursor = app.input.chars().count();
        }

        KeyCode::Char('a') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            open_attach_popup(app);
        }
        KeyCode::Char('x') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.remove_pending_image();
        }
        KeyCode::Char('l') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.clear_chat();
        }

        _ => {}
    }
}

fn handle_editing_mode(app: &mut App, key: KeyEvent, tx: &UnboundedSender<AppEvent>) {
    match key.code {
        KeyCode::Esc => {
            app.input_mode = InputMode::Normal;
        }
        KeyCode::Enter => {
            submit_message(app, tx);
        }

        // Control chords still work while typing
        KeyCode::Char('a') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            open_attach_popup(app);
        }
        KeyCode::Char('x') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.remove_pending_image();
        }
        KeyCode::Char('l') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.clear_chat();
        }

        KeyCode::Backspace => {
            if app.input_cursor > 0 {
                app.input_cursor -= 1;
                let byte_pos = char_to_byte_index(&app.input, app.input_cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            let char_count = app.input.chars().count();
            if app.input_cursor < char_count {
                let byte_pos = char_to_byte_index(&app.input, app.input_cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            app.input_cursor = app.input_cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            let char_count = app.input.chars().count();
            app.input_cursor = (app.input_cursor + 1).min(char_count);
        }
        KeyCode::Home => {
            app.input_cursor = 0;
        }
        KeyCode::End => {
            app.input_cursor = app.input.chars().count();
        }
        KeyCode::Char(c) => {
            let byte_pos = char_to_byte_index(&app.input, app.input_cursor);
            app.input.insert(byte_pos, c);
            app.input_cursor += 1;
        }
        _ => {}
    }
}

fn handle_attach_input(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            app.show_attach_input = false;
            app.attach_input.clear();
            app.attach_cursor = 0;
            app.attach_error = None;
        }
        KeyCode::Enter => {
            if app.attach_input.is_empty() {
                return;
            }
            let path = app.attach_input.clone();
            match app.attach_image(&path) {
                Ok(()) => {
                    app.show_attach_input = false;
                    app.attach_input.clear();
                    app.attach_cursor = 0;
                    app.attach_error = None;
                }
                Err(err) => {
                    app.attach_error = Some(err.to_string());
                }
            }
        }
        KeyCode::Backspace => {
            if app.attach_cursor > 0 {
                app.attach_cursor -= 1;
                let byte_pos = char_to_byte_index(&app.attach_input, app.attach_cursor);
                app.attach_input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            app.attach_cursor = app.attach_cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            let char_count = app.attach_input.chars().count();
            app.attach_cursor = (app.attach_cursor + 1).min(char_count);
        }
        KeyCode::Char(c) => {
            let byte_pos = char_to_byte_index(&app.attach_input, app.attach_cursor);
            app.attach_input.insert(byte_pos, c);
            app.attach_cursor += 1;
        }
        _ => {}
    }
}

fn open_attach_popup(app: &mut App) {
    app.show_attach_input = true;
    app.attach_input.clear();
    app.attach_cursor = 0;
    app.attach_error = None;
}

/// Run the send pipeline for the pending input. A no-op while a turn is in
/// flight or when there is nothing to send; a missing API key fails the
/// turn before any network call.
fn submit_message(app: &mut App, tx: &UnboundedSender<AppEvent>) {
    let Some(turn) = app.begin_send() else {
        return;
    };

    let Some(client) = app.gemini.clone() else {
        app.fail_send("GEMINI_API_KEY is not set and no api_key is configured");
        return;
    };

    let model = app.model.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let history = gemini::build_history(&turn.history);
        let parts = gemini::build_parts(turn.image.as_deref(), &turn.text);

        let chunk_tx = tx.clone();
        let result = client
            .stream_chat(&model, history, parts, move |event| {
                let _ = chunk_tx.send(AppEvent::Chat(event));
            })
            .await;

        // Exactly one terminal event per turn, so the sending flag always
        // clears
        let outcome = match result {
            Ok(()) => ChatEvent::Done,
            Err(err) => ChatEvent::Failed(format!("{err:#}")),
        };
        let _ = tx.send(AppEvent::Chat(outcome));
    });
}

fn handle_mouse(app: &mut App, mouse: MouseEvent) {
    match mouse.kind {
        MouseEventKind::ScrollDown => {
            app.scroll_down();
            app.scroll_down();
            app.scroll_down();
        }
        MouseEventKind::ScrollUp => {
            app.scroll_up();
            app.scroll_up();
            app.scroll_up();
        }
        _ => {}
    }
}
