use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};

/// Lines a subscriber may have queued before it is considered stalled.
pub const SUBSCRIBER_QUEUE: usize = 1024;

/// Sequence-numbered backlog of the most recent lines.
#[derive(Debug)]
struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // cursor 0 means "the most recent `limit` lines".
        let skip = if cursor == 0 {
            self.lines.len().saturating_sub(limit)
        } else {
            self.lines.partition_point(|(seq, _)| *seq <= cursor)
        };

        let mut last = cursor;
        let out = self
            .lines
            .iter()
            .skip(skip)
            .take(limit)
            .map(|(seq, line)| {
                last = *seq;
                line.clone()
            })
            .collect();
        (out, last)
    }
}

/// Collapses embedded line breaks so one emitted entry is always one line.
pub fn collapse_line(line: &str) -> String {
    line.trim_end_matches(['\r', '\n'])
        .split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

struct Inner {
    backlog: LogBuffer,
    next_subscriber: u64,
    subscribers: HashMap<u64, mpsc::Sender<String>>,
}

/// Fan-out of worker and supervisor log lines.
///
/// Each subscriber gets its own bounded FIFO queue. A subscriber whose
/// receiver is gone, or whose queue is full, is dropped on the next emit
/// without affecting the others; its receiver drains and then ends.
#[derive(Clone)]
pub struct LogHub {
    inner: Arc<Mutex<Inner>>,
}

pub struct LogSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

impl LogHub {
    pub fn new(backlog_lines: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                backlog: LogBuffer::new(backlog_lines),
                next_subscriber: 1,
                subscribers: HashMap::new(),
            })),
        }
    }

    pub async fn emit(&self, line: impl AsRef<str>) {
        let line = collapse_line(line.as_ref());
        let mut inner = self.inner.lock().await;
        inner.backlog.push_line(line.clone());
        inner.subscribers.retain(|id, tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = *id, "log subscriber stalled, dropping it");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub async fn subscribe(&self) -> LogSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.inner.lock().await;
        let id = inner.next_subscriber;
        inner.next_subscriber = inner.next_subscriber.saturating_add(1);
        inner.subscribers.insert(id, tx);
        LogSubscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.inner.lock().await.subscribers.remove(&id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    pub async fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.inner.lock().await.backlog.tail_after(cursor, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapse_line_joins_fragments() {
        assert_eq!(collapse_line("frame=1\r\n"), "frame=1");
        assert_eq!(collapse_line("a\nb\r\nc"), "a b c");
        assert_eq!(collapse_line("plain"), "plain");
    }

    #[test]
    fn backlog_is_bounded_and_cursor_based() {
        let mut buf = LogBuffer::new(3);
        for i in 1..=5 {
            buf.push_line(format!("l{i}"));
        }
        assert_eq!(buf.lines.len(), 3);

        let (lines, last) = buf.tail_after(0, 2);
        assert_eq!(lines, vec!["l4", "l5"]);
        assert_eq!(last, 5);

        let (lines, last) = buf.tail_after(3, 10);
        assert_eq!(lines, vec!["l4", "l5"]);
        assert_eq!(last, 5);

        let (lines, last) = buf.tail_after(5, 10);
        assert!(lines.is_empty());
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn emit_fans_out_in_order() {
        let hub = LogHub::new(10);
        let mut a = hub.subscribe().await;
        let mut b = hub.subscribe().await;

        hub.emit("one").await;
        hub.emit("two\n").await;

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.rx.recv().await.as_deref(), Some("one"));
            assert_eq!(sub.rx.recv().await.as_deref(), Some("two"));
        }
    }

    #[tokio::test]
    async fn closed_subscriber_is_evicted_without_disrupting_others() {
        let hub = LogHub::new(10);
        let gone = hub.subscribe().await;
        let mut kept = hub.subscribe().await;
        drop(gone);

        hub.emit("hello").await;
        assert_eq!(hub.subscriber_count().await, 1);
        assert_eq!(kept.rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn stalled_subscriber_is_evicted_and_others_keep_receiving() {
        let hub = LogHub::new(10);
        let mut stalled = hub.subscribe().await;
        let mut reader = hub.subscribe().await;

        for i in 0..=SUBSCRIBER_QUEUE {
            hub.emit(format!("line {i}")).await;
            assert_eq!(reader.rx.recv().await, Some(format!("line {i}")));
        }
        assert_eq!(hub.subscriber_count().await, 1);

        // The stalled queue holds what fit, then reports the end.
        let mut queued = 0;
        while stalled.rx.recv().await.is_some() {
            queued += 1;
        }
        assert_eq!(queued, SUBSCRIBER_QUEUE);

        hub.emit("after").await;
        assert_eq!(reader.rx.recv().await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn unsubscribe_removes_membership() {
        let hub = LogHub::new(10);
        let sub = hub.subscribe().await;
        hub.unsubscribe(sub.id).await;
        assert_eq!(hub.subscriber_count().await, 0);
    }
}
