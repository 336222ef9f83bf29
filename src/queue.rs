// Transmit-limited broadcast queue
//
// Outgoing gossip items ordered by fewest transmissions so far, so fresh
// information always wins the next packet. Items are retired once they have
// been sent `ceil(retransmit_mult * log2(n + 1))` times, which keeps every
// broadcast at Theta(log N) transmissions. A newer item for the same key
// displaces the older one, so superseded claims never compete with fresh
// gossip.

use tokio::sync::oneshot;

/// One queued gossip item.
struct QueuedBroadcast {
    /// Invalidation key; claims about the same subject share a key.
    key: String,

    /// Fully encoded message bytes.
    msg: Vec<u8>,

    /// How many times this item has been handed out.
    transmits: usize,

    /// Insertion order, used to break ties among equally-transmitted items.
    id: u64,

    /// Fired when the item leaves the queue for any reason.
    notify: Option<oneshot::Sender<()>>,
}

impl QueuedBroadcast {
    fn finished(mut self) {
        if let Some(tx) = self.notify.take() {
            let _ = tx.send(());
        }
    }
}

/// Bounded-retransmission broadcast queue.
#[derive(Default)]
pub struct TransmitQueue {
    items: Vec<QueuedBroadcast>,
    next_id: u64,
}

/// Retransmission cap for a cluster of `n` members.
pub fn retransmit_limit(mult: usize, n: usize) -> usize {
    let scale = ((n + 1) as f64).log2();
    (mult as f64 * scale).ceil() as usize
}

impl TransmitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a broadcast, displacing any queued item with the same key.
    /// The displaced item's notify hook fires immediately.
    pub fn enqueue(&mut self, key: String, msg: Vec<u8>, notify: Option<oneshot::Sender<()>>) {
        if let Some(pos) = self.items.iter().position(|item| item.key == key) {
            self.items.remove(pos).finished();
        }
        let id = self.next_id;
        self.next_id += 1;
        self.items.push(QueuedBroadcast {
            key,
            msg,
            transmits: 0,
            id,
            notify,
        });
    }

    /// Hand out the prefix of least-transmitted items whose combined size,
    /// with `overhead` bytes of framing per item, fits in `limit`.
    /// Increments each returned item's transmit counter and retires items
    /// that reach the cap for a cluster of `n` members.
    pub fn get_broadcasts(
        &mut self,
        overhead: usize,
        limit: usize,
        n: usize,
        retransmit_mult: usize,
    ) -> Vec<Vec<u8>> {
        if self.items.is_empty() {
            return Vec::new();
        }
        let cap = retransmit_limit(retransmit_mult, n);

        self.items
            .sort_by(|a, b| (a.transmits, a.id).cmp(&(b.transmits, b.id)));

        let mut used = 0;
        let mut picked = Vec::new();
        let mut retired = Vec::new();

        for (idx, item) in self.items.iter_mut().enumerate() {
            let size = overhead + item.msg.len();
            if used + size > limit {
                continue;
            }
            used += size;
            picked.push(item.msg.clone());
            item.transmits += 1;
            if item.transmits >= cap {
                retired.push(idx);
            }
        }

        for idx in retired.into_iter().rev() {
            self.items.remove(idx).finished();
        }

        picked
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything, firing every notify hook. Used at shutdown.
    pub fn reset(&mut self) {
        for item in self.items.drain(..) {
            item.finished();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_limit_grows_logarithmically() {
        assert_eq!(retransmit_limit(4, 0), 0);
        assert_eq!(retransmit_limit(4, 1), 4);
        assert_eq!(retransmit_limit(3, 7), 9);
        assert!(retransmit_limit(4, 1000) < 4 * 11);
    }

    #[test]
    fn test_least_transmitted_goes_first() {
        let mut q = TransmitQueue::new();
        q.enqueue("a".into(), b"old".to_vec(), None);

        // Transmit "old" once so the fresh item outranks it.
        let _ = q.get_broadcasts(0, 1024, 100, 4);
        q.enqueue("b".into(), b"new".to_vec(), None);

        let out = q.get_broadcasts(0, 1024, 100, 4);
        assert_eq!(out[0], b"new".to_vec());
        assert_eq!(out[1], b"old".to_vec());
    }

    #[test]
    fn test_same_key_invalidates() {
        let (tx, mut rx) = oneshot::channel();
        let mut q = TransmitQueue::new();
        q.enqueue("node-q".into(), b"suspect".to_vec(), Some(tx));
        q.enqueue("node-q".into(), b"alive".to_vec(), None);

        assert_eq!(q.len(), 1);
        // Displaced item's hook fired.
        assert!(rx.try_recv().is_ok());

        let out = q.get_broadcasts(0, 1024, 100, 4);
        assert_eq!(out, vec![b"alive".to_vec()]);
    }

    #[test]
    fn test_size_limit_respected() {
        let mut q = TransmitQueue::new();
        q.enqueue("a".into(), vec![0u8; 100], None);
        q.enqueue("b".into(), vec![0u8; 100], None);
        q.enqueue("c".into(), vec![0u8; 10], None);

        // Overhead 2 per item, budget 120: first 100-byte item fits, the
        // second does not, the 10-byte one still does.
        let out = q.get_broadcasts(2, 120, 100, 4);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 100);
        assert_eq!(out[1].len(), 10);
    }

    #[test]
    fn test_items_retire_at_cap() {
        let mut q = TransmitQueue::new();
        q.enqueue("a".into(), b"msg".to_vec(), None);

        // One member: cap = ceil(4 * log2(2)) = 4 transmissions.
        for _ in 0..4 {
            assert_eq!(q.get_broadcasts(0, 1024, 1, 4).len(), 1);
        }
        assert!(q.is_empty());
        assert!(q.get_broadcasts(0, 1024, 1, 4).is_empty());
    }

    #[test]
    fn test_reset_fires_hooks() {
        let (tx, mut rx) = oneshot::channel();
        let mut q = TransmitQueue::new();
        q.enqueue("a".into(), b"msg".to_vec(), Some(tx));
        q.reset();
        assert!(rx.try_recv().is_ok());
        assert!(q.is_empty());
    }
}
