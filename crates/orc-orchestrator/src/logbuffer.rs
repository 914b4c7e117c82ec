use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

const RING_CAPACITY: usize = 500;

/// A `tracing_subscriber::Layer` that mirrors every event into a bounded
/// ring buffer and a broadcast channel, so recent orchestrator
/// activity can be inspected without shipping logs to an external
/// aggregator. Never the primary sink — `fmt::layer()` still owns stdout.
pub struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<Mutex<VecDeque<String>>>,
}

impl BroadcastLayer {
    pub fn new() -> (Self, Arc<Mutex<VecDeque<String>>>, broadcast::Sender<String>) {
        let (tx, _rx) = broadcast::channel(1024);
        let ring = Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY)));
        (
            Self {
                tx: tx.clone(),
                ring: Arc::clone(&ring),
            },
            ring,
            tx,
        )
    }
}

struct MessageVisitor<'a> {
    message: &'a mut String,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            use std::fmt::Write;
            self.message.clear();
            let _ = write!(self.message, "{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "error",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut message = String::new();
        event.record(&mut MessageVisitor { message: &mut message });

        let line = serde_json::json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "level": level,
            "target": event.metadata().target(),
            "message": message,
        })
        .to_string();

        let _ = self.tx.send(line.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(line);
            if ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
        }
    }
}
