//! Event aggregation with debouncing and stable step ids
//!
//! Engines stream the full accumulated text of a step on every token. The
//! aggregator keeps only the newest snapshot per debounce window and gives
//! every event of one logical step (same author and role, back to back) the
//! same id, so consumers can update a message in place.

use std::time::Duration;

use tokio::time::Instant;

use super::Event;

/// Default debounce window
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct EventAggregator {
    window: Duration,
    current_id: Option<String>,
    last_author: Option<String>,
    last_role: Option<String>,
    buffer: Vec<Event>,
    last_emit: Option<Instant>,
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl EventAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            current_id: None,
            last_author: None,
            last_role: None,
            buffer: Vec::new(),
            last_emit: None,
        }
    }

    /// Id of the step currently open, if any
    pub fn current_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    /// Number of events waiting for the next emission
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer an event, assigning its step id
    ///
    /// Same author and role as the previous step continues it and reuses its
    /// id. Anything else opens a new step with a fresh id. Whatever id the
    /// event arrived with is overwritten.
    pub fn add(&mut self, mut event: Event) {
        let continuing = self
            .current_id
            .as_ref()
            .filter(|_| {
                self.last_author.as_deref() == Some(event.author.as_str())
                    && self.last_role.as_deref() == Some(event.role())
            })
            .cloned();

        match continuing {
            Some(id) => event.id = id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                event.id = id.clone();
                self.current_id = Some(id);
                self.last_author = Some(event.author.clone());
                self.last_role = Some(event.content.role.clone());
            }
        }

        self.buffer.push(event);
    }

    /// True once the buffer is non-empty and a full window has passed since
    /// the last emission (or nothing has been emitted yet)
    pub fn should_emit(&self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        match self.last_emit {
            Some(at) => at.elapsed() >= self.window,
            None => true,
        }
    }

    /// When the buffered event becomes due; `None` while the buffer is empty
    pub fn next_emit_at(&self) -> Option<Instant> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(match self.last_emit {
            Some(at) => at + self.window,
            None => Instant::now(),
        })
    }

    /// Newest buffered event; clears the buffer and restarts the window
    ///
    /// Older events in the buffer are dropped, not merged: each snapshot
    /// already holds the step's full text.
    pub fn take_latest(&mut self) -> Option<Event> {
        let latest = self.buffer.pop()?;
        self.buffer.clear();
        self.last_emit = Some(Instant::now());
        Some(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::Event;
    use std::collections::HashSet;

    fn event(author: &str, role: &str, text: &str) -> Event {
        let mut event = Event::synthetic(text);
        event.author = author.to_string();
        event.content.role = role.to_string();
        event
    }

    #[test]
    fn test_same_step_keeps_one_id() {
        let mut agg = EventAggregator::default();
        let mut ids = HashSet::new();
        for i in 0..10 {
            agg.add(event("writer", "agent", &"x".repeat(i)));
            ids.insert(agg.take_latest().unwrap().id);
        }
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_incoming_id_is_overwritten() {
        let mut agg = EventAggregator::default();
        let mut e = event("a", "agent", "t");
        e.id = "from-engine".to_string();
        agg.add(e);
        let out = agg.take_latest().unwrap();
        assert_ne!(out.id, "from-engine");
        assert_eq!(agg.current_id(), Some(out.id.as_str()));
    }

    #[test]
    fn test_two_groups_give_two_ids() {
        let mut agg = EventAggregator::default();
        let mut ids = Vec::new();
        for _ in 0..3 {
            agg.add(event("planner", "agent", "plan"));
            ids.push(agg.take_latest().unwrap().id);
        }
        for _ in 0..3 {
            agg.add(event("tool", "user", "result"));
            ids.push(agg.take_latest().unwrap().id);
        }
        let distinct: HashSet<_> = ids.iter().collect();
        assert_eq!(distinct.len(), 2);
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[3], ids[5]);
    }

    #[test]
    fn test_switching_steps_opens_new_ids() {
        let mut agg = EventAggregator::default();
        agg.add(event("a", "agent", "1"));
        let first = agg.take_latest().unwrap().id;
        agg.add(event("b", "agent", "2"));
        let second = agg.take_latest().unwrap().id;
        agg.add(event("a", "agent", "3"));
        let third = agg.take_latest().unwrap().id;
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_ne!(first, third);
    }

    #[test]
    fn test_role_change_is_new_step() {
        let mut agg = EventAggregator::default();
        agg.add(event("a", "agent", "1"));
        let first = agg.take_latest().unwrap().id;
        agg.add(event("a", "user", "2"));
        assert_ne!(agg.take_latest().unwrap().id, first);
    }

    #[test]
    fn test_take_latest_keeps_newest_only() {
        let mut agg = EventAggregator::default();
        assert!(agg.take_latest().is_none());
        agg.add(event("a", "agent", "H"));
        agg.add(event("a", "agent", "He"));
        agg.add(event("a", "agent", "Hel"));
        assert_eq!(agg.pending(), 3);

        let latest = agg.take_latest().unwrap();
        assert_eq!(latest.first_text(), Some("Hel"));
        assert_eq!(agg.pending(), 0);
        assert!(agg.take_latest().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_emit_respects_window() {
        let mut agg = EventAggregator::new(Duration::from_millis(200));
        assert!(!agg.should_emit());

        // First event goes out immediately
        agg.add(event("a", "agent", "1"));
        assert!(agg.should_emit());
        agg.take_latest();

        agg.add(event("a", "agent", "2"));
        assert!(!agg.should_emit());
        tokio::time::advance(Duration::from_millis(199)).await;
        assert!(!agg.should_emit());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(agg.should_emit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_emit_at_follows_window() {
        let mut agg = EventAggregator::new(Duration::from_millis(200));
        assert!(agg.next_emit_at().is_none());

        agg.add(event("a", "agent", "1"));
        assert!(agg.next_emit_at().unwrap() <= Instant::now());
        agg.take_latest();
        let emitted_at = Instant::now();
        assert!(agg.next_emit_at().is_none());

        agg.add(event("a", "agent", "2"));
        assert_eq!(agg.next_emit_at(), Some(emitted_at + Duration::from_millis(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emission_count_bounded_by_window() {
        let window = Duration::from_millis(200);
        let mut agg = EventAggregator::new(window);
        let period = Duration::from_secs(2);
        let tick = Duration::from_millis(10);

        let mut emitted = 0u32;
        let mut elapsed = Duration::ZERO;
        while elapsed < period {
            agg.add(event("a", "agent", "token"));
            if agg.should_emit() {
                agg.take_latest();
                emitted += 1;
            }
            tokio::time::advance(tick).await;
            elapsed += tick;
        }

        // 2000ms / 200ms = 10 windows, 200 events fed
        assert!((9..=11).contains(&emitted), "emitted {}", emitted);
    }
}
