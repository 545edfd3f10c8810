//! In-memory activity feed: the most recent log lines, newest first.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const ACTIVITY_CAPACITY: usize = 200;

pub const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

pub fn timestamp(at: OffsetDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).unwrap_or_default()
}

#[derive(Clone)]
pub struct ActivityLog {
    entries: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(ACTIVITY_CAPACITY)
    }
}

impl ActivityLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, message: &str) {
        let line = format!("[{}] {}", timestamp(OffsetDateTime::now_utc()), message);
        let mut entries = self.entries.lock();
        entries.push_front(line);
        entries.truncate(self.capacity);
    }

    pub fn recent(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layer(&self) -> ActivityLayer {
        ActivityLayer { log: self.clone() }
    }
}

/// Mirrors info-and-above events into an [`ActivityLog`].
pub struct ActivityLayer {
    log: ActivityLog,
}

impl<S> Layer<S> for ActivityLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > Level::INFO {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if let Some(message) = visitor.message {
            self.log.push(&message);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn keeps_newest_entries_first() {
        let log = ActivityLog::with_capacity(3);
        for i in 0..5 {
            log.push(&format!("event {}", i));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 3);
        assert!(recent[0].ends_with("] event 4"));
        assert!(recent[2].ends_with("] event 2"));
        assert!(recent[0].starts_with('['));
    }

    #[test]
    fn timestamp_has_fixed_shape() {
        let at = OffsetDateTime::from_unix_timestamp(0).unwrap();
        assert_eq!(timestamp(at), "1970-01-01 00:00:00");
    }

    #[test]
    fn layer_mirrors_info_but_not_debug() {
        let log = ActivityLog::default();
        let subscriber = tracing_subscriber::registry().with(log.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("scan started");
            tracing::debug!("noise");
            tracing::warn!(count = 3, "retrying");
        });
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].ends_with("retrying"));
        assert!(recent[1].ends_with("scan started"));
    }
}
