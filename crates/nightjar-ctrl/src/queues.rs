//! Per-device in-memory inbox queues.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Default item TTL: seven days.
pub(crate) const DEFAULT_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// One queued envelope awaiting pickup by its recipient device.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct InboxItem {
    /// Queue-assigned (or sender-carried) item id.
    pub id: String,
    /// Enqueue (or sender) timestamp, ms.
    pub ts: u64,
    /// Sending device, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// The opaque envelope.
    pub envelope: Value,
    /// When the sweep may drop this item.
    #[serde(skip)]
    pub expires_at: u64,
}

/// All device queues.
///
/// Items are held in insertion order and paged by index: the cursor a
/// reader gets back is the index of the last item it saw.  Queues live
/// in memory only; after a restart, cursors start over at zero and
/// readers deduplicate by envelope event id.
#[derive(Debug, Default)]
pub struct InboxQueues {
    /// Queue per recipient device id.
    queues: Mutex<HashMap<String, Vec<InboxItem>>>,
}

impl InboxQueues {
    /// Construct an empty queue set.
    pub fn new() -> Self {
        InboxQueues::default()
    }

    /// Append an item to `device`'s queue.
    pub fn enqueue(&self, device: &str, item: InboxItem) {
        let mut queues = self.queues.lock().expect("poisoned inbox lock");
        queues.entry(device.to_owned()).or_default().push(item);
    }

    /// Page through `device`'s queue.
    ///
    /// `after` is the cursor from the previous page (`-1` or absent
    /// means "from the beginning"); `limit` is clamped to at least 1.
    /// Returns the items and the cursor for the next page (`None` when
    /// this page was empty).
    pub fn query(&self, device: &str, after: i64, limit: usize) -> (Vec<InboxItem>, Option<u64>) {
        let limit = limit.max(1);
        let start = if after < 0 { 0 } else { (after + 1) as usize };
        let queues = self.queues.lock().expect("poisoned inbox lock");
        let Some(queue) = queues.get(device) else {
            return (Vec::new(), None);
        };
        if start >= queue.len() {
            return (Vec::new(), None);
        }
        let end = (start + limit).min(queue.len());
        let items: Vec<InboxItem> = queue[start..end].to_vec();
        let next_after = (end - 1) as u64;
        (items, Some(next_after))
    }

    /// Drop expired items everywhere; returns how many were removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut queues = self.queues.lock().expect("poisoned inbox lock");
        let mut removed = 0;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|item| item.expires_at >= now_ms);
            removed += before - queue.len();
        }
        queues.retain(|_, q| !q.is_empty());
        if removed > 0 {
            debug!("inbox sweep removed {} expired item(s)", removed);
        }
        removed
    }

    /// Total queued items, across all devices.
    pub fn len(&self) -> usize {
        self.queues
            .lock()
            .expect("poisoned inbox lock")
            .values()
            .map(Vec::len)
            .sum()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    fn item(id: &str, ts: u64) -> InboxItem {
        InboxItem {
            id: id.to_owned(),
            ts,
            from: None,
            envelope: Value::String(format!("env-{id}")),
            expires_at: ts + DEFAULT_TTL_MS,
        }
    }

    #[test]
    fn cursor_walks_in_insertion_order_without_repeats() {
        let q = InboxQueues::new();
        for n in 0..5 {
            q.enqueue("dev", item(&format!("i{n}"), n));
        }

        let (page1, next) = q.query("dev", -1, 2);
        assert_eq!(
            page1.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["i0", "i1"]
        );
        let next = next.unwrap();
        assert_eq!(next, 1);

        let (page2, next) = q.query("dev", next as i64, 2);
        assert_eq!(
            page2.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["i2", "i3"]
        );
        let next = next.unwrap();

        let (page3, next) = q.query("dev", next as i64, 2);
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].id, "i4");
        let next = next.unwrap();

        // Fully drained: empty page, null cursor.
        let (page4, next) = q.query("dev", next as i64, 2);
        assert!(page4.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn unknown_device_is_empty() {
        let q = InboxQueues::new();
        let (items, next) = q.query("nobody", -1, 50);
        assert!(items.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn limit_is_at_least_one() {
        let q = InboxQueues::new();
        q.enqueue("dev", item("a", 1));
        let (items, _) = q.query("dev", -1, 0);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn sweep_drops_expired() {
        let q = InboxQueues::new();
        let mut old = item("old", 0);
        old.expires_at = 10;
        q.enqueue("dev", old);
        q.enqueue("dev", item("new", 100));

        assert_eq!(q.sweep(50), 1);
        assert_eq!(q.len(), 1);
        let (items, _) = q.query("dev", -1, 10);
        assert_eq!(items[0].id, "new");

        // Sweeping everything away removes the device entry too.
        assert_eq!(q.sweep(u64::MAX), 1);
        assert!(q.is_empty());
    }
}
