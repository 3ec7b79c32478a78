use chrono::{DateTime, Local};

use crate::config::Config;
use crate::gemini::{self, GeminiClient};

/// Greeting shown in a fresh transcript (and after a clear).
pub const GREETING: &str = "Hello! Ask me anything, or attach an image with Ctrl+A.";

/// Prompt substituted when the user sends an image with no text.
pub const IMAGE_ONLY_PROMPT: &str = "Describe this image.";

/// Single user-visible reply for every failed turn. The real cause goes to
/// the log file only.
pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't get a response. Please check your connection and try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// A web citation reported by the model's search grounding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub uri: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Local>,
    /// Data-URL image payload, user messages only, immutable once set.
    pub image: Option<String>,
    /// Citation sources, assistant messages only, deduplicated by URI.
    pub sources: Vec<Source>,
}

/// Updates produced by the streaming task, delivered over the app event
/// channel. Exactly one `Done` or `Failed` arrives per turn.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Chunk { text: String, sources: Vec<Source> },
    Done,
    Failed(String),
}

/// Snapshot handed to the streaming task when a send begins.
#[derive(Debug, Clone)]
pub struct SendTurn {
    /// Transcript as it stood before this turn's user message.
    pub history: Vec<Message>,
    pub text: String,
    pub image: Option<String>,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,

    // Transcript
    pub messages: Vec<Message>,

    // Pending input
    pub input: String,
    pub input_cursor: usize, // cursor position in input, in chars
    pub pending_image: Option<String>,

    // Send pipeline
    pub is_sending: bool,

    // Chat view state
    pub chat_scroll: u16,
    pub chat_height: u16, // inner height of chat area, set during render
    pub chat_width: u16,  // inner width of chat area, for wrap calculations

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    // Attach popup state
    pub show_attach_input: bool,
    pub attach_input: String,
    pub attach_cursor: usize,
    pub attach_error: Option<String>,

    // Gemini client (None until an API key is configured)
    pub gemini: Option<GeminiClient>,
    pub model: String,

    // Streaming accumulator for the in-progress assistant message
    pub stream_msg_id: Option<u64>,
    pub stream_text: String,
    pub stream_sources: Vec<Source>,

    next_id: u64,
}

impl App {
    pub fn new() -> anyhow::Result<Self> {
        let config = Config::load().unwrap_or_else(|_| Config::new());

        // Env var first, then config file
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .or_else(|| config.api_key.clone());
        let gemini = api_key.as_deref().map(GeminiClient::new);

        let model = config
            .default_model
            .unwrap_or_else(|| gemini::DEFAULT_MODEL.to_string());

        Ok(Self::from_parts(gemini, model))
    }

    /// Build an App around an already-resolved client and model. `new`
    /// handles the env/config lookup; tests construct directly.
    pub fn from_parts(gemini: Option<GeminiClient>, model: String) -> Self {
        let mut app = Self {
            should_quit: false,
            input_mode: InputMode::Editing,

            messages: Vec::new(),

            input: String::new(),
            input_cursor: 0,
            pending_image: None,

            is_sending: false,

            chat_scroll: 0,
            chat_height: 0,
            chat_width: 0,

            animation_frame: 0,

            show_attach_input: false,
            attach_input: String::new(),
            attach_cursor: 0,
            attach_error: None,

            gemini,
            model,

            stream_msg_id: None,
            stream_text: String::new(),
            stream_sources: Vec::new(),

            next_id: 0,
        };
        let greeting = app.greeting_message();
        app.messages.push(greeting);
        app
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn greeting_message(&mut self) -> Message {
        Message {
            id: self.alloc_id(),
            role: Role::Assistant,
            content: GREETING.to_string(),
            timestamp: Local::now(),
            image: None,
            sources: Vec::new(),
        }
    }

    // Transcript operations

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the entry with the same id, producing a new sequence and
    /// leaving every other entry untouched. A missing id is a no-op.
    pub fn replace_message(&mut self, updated: Message) {
        self.messages = self
            .messages
            .iter()
            .map(|msg| {
                if msg.id == updated.id {
                    updated.clone()
                } else {
                    msg.clone()
                }
            })
            .collect();
    }

    /// Reset the transcript to a single fresh greeting.
    pub fn clear_chat(&mut self) {
        let greeting = self.greeting_message();
        self.messages = vec![greeting];
        self.chat_scroll = 0;
    }

    // Send pipeline

    /// `Idle -> Sending`. Appends the user message, clears the pending
    /// input, inserts the empty assistant placeholder, and returns the
    /// snapshot for the streaming task. Returns None (and changes nothing)
    /// when a send is already in flight or there is nothing to send.
    pub fn begin_send(&mut self) -> Option<SendTurn> {
        if self.is_sending {
            return None;
        }
        let text = self.input.trim().to_string();
        let image = self.pending_image.clone();
        if text.is_empty() && image.is_none() {
            return None;
        }
        let content = if text.is_empty() {
            IMAGE_ONLY_PROMPT.to_string()
        } else {
            text
        };

        let history = self.messages.clone();

        let user_id = self.alloc_id();
        self.push_message(Message {
            id: user_id,
            role: Role::User,
            content: content.clone(),
            timestamp: Local::now(),
            image: image.clone(),
            sources: Vec::new(),
        });

        // Input area is ready for the next entry before the network call
        self.input.clear();
        self.input_cursor = 0;
        self.pending_image = None;

        let placeholder_id = self.alloc_id();
        self.push_message(Message {
            id: placeholder_id,
            role: Role::Assistant,
            content: String::new(),
            timestamp: Local::now(),
            image: None,
            sources: Vec::new(),
        });

        self.is_sending = true;
        self.stream_msg_id = Some(placeholder_id);
        self.stream_text.clear();
        self.stream_sources.clear();
        self.scroll_chat_to_bottom();

        Some(SendTurn {
            history,
            text: content,
            image,
        })
    }

    pub fn apply_chat_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Chunk { text, sources } => self.apply_chunk(&text, sources),
            ChatEvent::Done => self.finish_send(),
            ChatEvent::Failed(diagnostic) => self.fail_send(&diagnostic),
        }
    }

    /// Merge one stream chunk into the accumulator and overwrite the
    /// placeholder with the full accumulated text and source set.
    pub fn apply_chunk(&mut self, text: &str, sources: Vec<Source>) {
        self.stream_text.push_str(text);
        for source in sources {
            // First occurrence wins, title included
            if !self.stream_sources.iter().any(|s| s.uri == source.uri) {
                self.stream_sources.push(source);
            }
        }

        if let Some(id) = self.stream_msg_id {
            if let Some(current) = self.messages.iter().find(|m| m.id == id) {
                let mut updated = current.clone();
                updated.content = self.stream_text.clone();
                updated.sources = self.stream_sources.clone();
                self.replace_message(updated);
            }
        }
        self.scroll_chat_to_bottom();
    }

    /// `Sending -> Idle` on stream exhaustion. The placeholder keeps the
    /// final content and is never touched again.
    pub fn finish_send(&mut self) {
        self.is_sending = false;
        self.stream_msg_id = None;
        self.stream_text.clear();
        self.stream_sources.clear();
    }

    /// `Sending -> Idle` on any failure. The placeholder is removed (any
    /// partial text is superseded, not merged) and the uniform fallback
    /// reply is appended; the cause only goes to the log.
    pub fn fail_send(&mut self, diagnostic: &str) {
        tracing::error!("chat turn failed: {diagnostic}");

        if let Some(id) = self.stream_msg_id.take() {
            self.messages = self
                .messages
                .iter()
                .filter(|m| m.id != id)
                .cloned()
                .collect();
        }

        let fallback_id = self.alloc_id();
        self.push_message(Message {
            id: fallback_id,
            role: Role::Assistant,
            content: FALLBACK_REPLY.to_string(),
            timestamp: Local::now(),
            image: None,
            sources: Vec::new(),
        });

        self.is_sending = false;
        self.stream_text.clear();
        self.stream_sources.clear();
        self.scroll_chat_to_bottom();
    }

    // Image attachment

    /// Read a file and hold it as the single pending data-URL payload.
    pub fn attach_image(&mut self, path: &str) -> anyhow::Result<()> {
        let bytes = std::fs::read(path)?;
        self.pending_image = Some(gemini::to_data_url(&bytes));
        Ok(())
    }

    pub fn remove_pending_image(&mut self) {
        self.pending_image = None;
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.is_sending {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    // Chat view scrolling

    pub fn scroll_down(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_add(1);
    }

    pub fn scroll_up(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_sub(1);
    }

    /// Scroll so the newest lines (including the "Thinking..." indicator)
    /// stay visible while a reply streams in.
    pub fn scroll_chat_to_bottom(&mut self) {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total_lines: u16 = 0;

        for msg in &self.messages {
            total_lines += 1; // Role line ("You:" or "Gemini:")
            if msg.image.is_some() {
                total_lines += 1; // "[image]" line
            }
            for line in msg.content.lines() {
                // Use character count, not byte length, for proper UTF-8 handling
                let char_count = line.chars().count();
                if char_count == 0 {
                    total_lines += 1;
                } else {
                    total_lines += ((char_count / wrap_width) + 1) as u16;
                }
            }
            if !msg.sources.is_empty() {
                total_lines += 1 + msg.sources.len() as u16;
            }
            total_lines += 1; // Blank line after message
        }

        if self.is_sending {
            total_lines += 1; // "Thinking..." line on the placeholder
        }

        let visible_height = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };

        if total_lines > visible_height {
            self.chat_scroll = total_lines.saturating_sub(visible_height);
        } else {
            self.chat_scroll = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_app() -> App {
        App::from_parts(None, gemini::DEFAULT_MODEL.to_string())
    }

    fn source(uri: &str, title: &str) -> Source {
        Source {
            uri: uri.to_string(),
            title: title.to_string(),
        }
    }

    #[test]
    fn test_empty_send_is_noop() {
        let mut app = test_app();
        app.input = "   ".to_string();
        let before = app.messages.len();
        assert!(app.begin_send().is_none());
        assert_eq!(app.messages.len(), before);
        assert!(!app.is_sending);
    }

    #[test]
    fn test_send_while_sending_is_noop() {
        let mut app = test_app();
        app.input = "first".to_string();
        assert!(app.begin_send().is_some());
        let before = app.messages.len();

        app.input = "second".to_string();
        assert!(app.begin_send().is_none());
        assert_eq!(app.messages.len(), before);
        assert_eq!(app.input, "second");
    }

    #[test]
    fn test_single_chunk_stream() {
        let mut app = test_app();
        let before = app.messages.len();

        app.input = "hello".to_string();
        let turn = app.begin_send().expect("send should start");
        assert_eq!(turn.text, "hello");
        assert_eq!(turn.history.len(), before);

        app.apply_chat_event(ChatEvent::Chunk {
            text: "Hi".to_string(),
            sources: Vec::new(),
        });
        app.apply_chat_event(ChatEvent::Done);

        assert_eq!(app.messages.len(), before + 2);
        let reply = app.messages.last().expect("reply present");
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Hi");
        assert!(reply.sources.is_empty());
        assert!(!app.is_sending);
    }

    #[test]
    fn test_chunks_accumulate_as_deltas() {
        let mut app = test_app();
        app.input = "hello".to_string();
        app.begin_send();

        app.apply_chunk("The answer", Vec::new());
        app.apply_chunk(" is 42.", Vec::new());

        let reply = app.messages.last().expect("reply present");
        assert_eq!(reply.content, "The answer is 42.");
    }

    #[test]
    fn test_source_dedup_keeps_first_title() {
        let mut app = test_app();
        app.input = "what's new".to_string();
        app.begin_send();

        app.apply_chunk("a", vec![source("https://a.example", "First title")]);
        app.apply_chunk(
            "b",
            vec![
                source("https://a.example", "Second title"),
                source("https://b.example", "Other"),
            ],
        );
        app.apply_chat_event(ChatEvent::Done);

        let reply = app.messages.last().expect("reply present");
        assert_eq!(reply.sources.len(), 2);
        assert_eq!(reply.sources[0].uri, "https://a.example");
        assert_eq!(reply.sources[0].title, "First title");
        assert_eq!(reply.sources[1].uri, "https://b.example");
    }

    #[test]
    fn test_missing_credential_leaves_no_placeholder() {
        let mut app = test_app();
        let before = app.messages.len();

        app.input = "hello".to_string();
        assert!(app.begin_send().is_some());
        app.fail_send("GEMINI_API_KEY is not set");

        // Exactly one user message and one fallback reply were added
        assert_eq!(app.messages.len(), before + 2);
        let reply = app.messages.last().expect("reply present");
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, FALLBACK_REPLY);
        assert!(!app.messages.iter().any(|m| m.content.is_empty()));
        assert!(!app.is_sending);
    }

    #[test]
    fn test_mid_stream_failure_supersedes_partial_text() {
        let mut app = test_app();
        app.input = "hello".to_string();
        app.begin_send();

        app.apply_chunk("partial answ", Vec::new());
        app.apply_chat_event(ChatEvent::Failed("connection reset".to_string()));

        let reply = app.messages.last().expect("reply present");
        assert_eq!(reply.content, FALLBACK_REPLY);
        assert!(!app.messages.iter().any(|m| m.content.contains("partial")));
        assert!(!app.is_sending);
    }

    #[test]
    fn test_clear_chat_resets_to_single_greeting() {
        for target_len in [1usize, 5, 50] {
            let mut app = test_app();
            while app.messages.len() < target_len {
                let id = app.alloc_id();
                app.push_message(Message {
                    id,
                    role: Role::User,
                    content: format!("message {id}"),
                    timestamp: Local::now(),
                    image: None,
                    sources: Vec::new(),
                });
            }
            assert_eq!(app.messages.len(), target_len);

            app.clear_chat();
            assert_eq!(app.messages.len(), 1);
            assert_eq!(app.messages[0].content, GREETING);
            assert_eq!(app.messages[0].role, Role::Assistant);
        }
    }

    #[test]
    fn test_image_only_send_uses_placeholder_prompt() {
        let mut app = test_app();
        app.pending_image = Some("data:image/jpeg;base64,AAAA".to_string());

        let turn = app.begin_send().expect("image-only send should start");
        assert_eq!(turn.text, IMAGE_ONLY_PROMPT);

        let user = app
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .expect("user message present");
        assert_eq!(user.content, IMAGE_ONLY_PROMPT);
        assert_eq!(user.image.as_deref(), Some("data:image/jpeg;base64,AAAA"));
        assert!(app.pending_image.is_none());
    }

    #[test]
    fn test_replace_message_ignores_unknown_id() {
        let mut app = test_app();
        let before = app.messages.clone();
        app.replace_message(Message {
            id: 9999,
            role: Role::Assistant,
            content: "ghost".to_string(),
            timestamp: Local::now(),
            image: None,
            sources: Vec::new(),
        });
        assert_eq!(app.messages, before);
    }

    #[test]
    fn test_clear_during_stream_drops_updates() {
        let mut app = test_app();
        app.input = "hello".to_string();
        app.begin_send();
        app.clear_chat();

        app.apply_chunk("late chunk", Vec::new());
        app.apply_chat_event(ChatEvent::Done);

        assert_eq!(app.messages.len(), 1);
        assert_eq!(app.messages[0].content, GREETING);
        assert!(!app.is_sending);
    }

    #[test]
    fn test_attach_image_builds_data_url() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&[0xFF, 0xD8, 0xFF, 0xE0]).expect("write");

        let mut app = test_app();
        app.attach_image(file.path().to_str().expect("utf-8 path"))
            .expect("attach succeeds");

        let image = app.pending_image.as_deref().expect("image pending");
        assert!(image.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn test_attach_missing_file_leaves_no_image() {
        let mut app = test_app();
        assert!(app.attach_image("/no/such/file.jpg").is_err());
        assert!(app.pending_image.is_none());
    }
}
