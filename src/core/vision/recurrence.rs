//! 重复出现追踪 - 同一 label 在短时间内再次被匹配时发出提醒

use super::label::Label;
use std::collections::HashMap;
use std::sync::Mutex;

/// A label matched again inside the recurrence window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceEvent {
    pub label_id: String,
    pub label_name: String,
    pub matched_at_ms: u64,
    /// When the presentation layer should take the warning down.
    pub dismiss_at_ms: u64,
}

impl RecurrenceEvent {
    pub fn new(label: &Label, matched_at_ms: u64, display_ms: u64) -> Self {
        Self {
            label_id: label.id.clone(),
            label_name: label.name.clone(),
            matched_at_ms,
            dismiss_at_ms: matched_at_ms.saturating_add(display_ms),
        }
    }

    pub fn is_visible(&self, now_ms: u64) -> bool {
        now_ms >= self.matched_at_ms && now_ms < self.dismiss_at_ms
    }
}

/// Last positive match time per label id. Entries live for the session.
pub struct RecurrenceTracker {
    window_ms: u64,
    last_matched: Mutex<HashMap<String, u64>>,
}

impl RecurrenceTracker {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_matched: Mutex::new(HashMap::new()),
        }
    }

    /// True when `label_id` was matched less than the window ago. The stored
    /// time moves to `now_ms` either way, so the window slides.
    pub fn record_and_check(&self, label_id: &str, now_ms: u64) -> bool {
        let mut last_matched = match self.last_matched.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let recurred = last_matched
            .get(label_id)
            .map(|&last| now_ms.saturating_sub(last) < self.window_ms)
            .unwrap_or(false);
        last_matched.insert(label_id.to_string(), now_ms);
        recurred
    }

    pub fn last_matched(&self, label_id: &str) -> Option<u64> {
        self.last_matched.lock().ok()?.get(label_id).copied()
    }

    pub fn len(&self) -> usize {
        self.last_matched.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
