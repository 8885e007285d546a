//! Worker → supervisor status channel.
//!
//! The worker speaks to its supervisor through JSON lines on stdout: one
//! `{"ready": true, "port": P}` notice once the listener is bound, then a
//! `{"level", "text", "timestamp"}` record for every log event. The records
//! come from [`StatusChannelLayer`], a `tracing` layer, so the worker logs
//! with the ordinary macros and the supervisor sees the same stream.

use std::fmt::Write as _;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Exit code the worker uses when its port is already taken.
pub const EXIT_PORT_IN_USE: i32 = 3;

/// One line on the status channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Ready { ready: bool, port: u16 },
    Log {
        level: String,
        text: String,
        timestamp: String,
    },
}

impl WorkerMessage {
    /// Parse one stdout line. Lines that are not status records yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Line sink for status records. Clones share the same writer.
#[derive(Clone)]
pub struct StatusChannel {
    out: Arc<Mutex<dyn Write + Send>>,
}

impl StatusChannel {
    pub fn stdout() -> Self {
        Self::to_writer(std::io::stdout())
    }

    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn ready(&self, port: u16) {
        self.emit(&WorkerMessage::Ready { ready: true, port });
    }

    /// Write one record. Failures are swallowed: a closed stdout must not take
    /// the worker down, and logging here would recurse into the layer.
    pub fn emit(&self, message: &WorkerMessage) {
        let Ok(mut line) = serde_json::to_string(message) else {
            return;
        };
        line.push('\n');
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }
}

// ─── Tracing layer ───────────────────────────────────────────────────────────

/// Mirrors every enabled event onto a [`StatusChannel`].
pub struct StatusChannelLayer {
    channel: StatusChannel,
}

impl StatusChannelLayer {
    pub fn new(channel: StatusChannel) -> Self {
        Self { channel }
    }
}

impl<S: Subscriber> Layer<S> for StatusChannelLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut text = EventText::default();
        event.record(&mut text);

        self.channel.emit(&WorkerMessage::Log {
            level: level_name(event.metadata().level()).to_string(),
            text: text.finish(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

/// Flattens an event into `message key=value ...`.
#[derive(Default)]
struct EventText {
    message: String,
    fields: String,
}

impl EventText {
    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        let _ = write!(self.fields, " {name}={value}");
    }

    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for EventText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    /// In-memory writer shared between the channel and the test.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        pub(crate) fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_ready_line_shape() {
        let buffer = SharedBuffer::default();
        StatusChannel::to_writer(buffer.clone()).ready(3002);

        let lines = buffer.lines();
        assert_eq!(lines, vec![r#"{"ready":true,"port":3002}"#]);
        assert_eq!(
            WorkerMessage::parse(&lines[0]),
            Some(WorkerMessage::Ready {
                ready: true,
                port: 3002
            })
        );
    }

    #[test]
    fn test_layer_mirrors_events_with_fields() {
        let buffer = SharedBuffer::default();
        let subscriber = tracing_subscriber::registry()
            .with(StatusChannelLayer::new(StatusChannel::to_writer(buffer.clone())));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(provider = "weather", attempts = 2, "connect failed");
        });

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        match WorkerMessage::parse(&lines[0]) {
            Some(WorkerMessage::Log { level, text, .. }) => {
                assert_eq!(level, "warn");
                assert_eq!(text, "connect failed provider=weather attempts=2");
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn test_parse_ignores_plain_output() {
        assert_eq!(WorkerMessage::parse("listening..."), None);
        assert_eq!(WorkerMessage::parse("{not json"), None);
        assert!(matches!(
            WorkerMessage::parse(r#"{"level":"info","text":"hi","timestamp":"t"}"#),
            Some(WorkerMessage::Log { .. })
        ));
    }
}
