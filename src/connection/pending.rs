//! Outgoing message bookkeeping.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::{PacketType, SeqNum};
use crate::types::{RetryMode, SendCallback};

/// How the caller learns a message's fate (acked or not).
pub enum Completion {
    /// Boxed callback invoked once.
    Callback(SendCallback),
    /// Oneshot channel resolved once.
    Channel(oneshot::Sender<bool>),
    /// One share of a fragmented send; the tracker aggregates.
    Fragment(FragmentTracker),
}

impl Completion {
    /// Consume, reporting the outcome exactly once.
    pub fn resolve(self, acked: bool) {
        match self {
            Self::Callback(cb) => cb(acked),
            Self::Channel(tx) => {
                let _ = tx.send(acked);
            }
            Self::Fragment(tracker) => tracker.fragment_done(acked),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => write!(f, "Completion::Callback"),
            Self::Channel(_) => write!(f, "Completion::Channel"),
            Self::Fragment(_) => write!(f, "Completion::Fragment"),
        }
    }
}

struct FragmentProgress {
    remaining: usize,
    resolved: bool,
    completion: Option<Completion>,
}

/// Aggregates per-fragment outcomes into a single user-visible result:
/// `true` once every fragment is acked, `false` on the first failure.
#[derive(Clone)]
pub struct FragmentTracker {
    inner: Arc<Mutex<FragmentProgress>>,
}

impl FragmentTracker {
    pub fn new(fragments: usize, completion: Option<Completion>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FragmentProgress {
                remaining: fragments,
                resolved: false,
                completion,
            })),
        }
    }

    fn fragment_done(&self, acked: bool) {
        let mut progress = self.inner.lock();
        if progress.resolved {
            return;
        }
        if acked {
            progress.remaining = progress.remaining.saturating_sub(1);
            if progress.remaining == 0 {
                progress.resolved = true;
                if let Some(completion) = progress.completion.take() {
                    drop(progress);
                    completion.resolve(true);
                }
            }
        } else {
            progress.resolved = true;
            if let Some(completion) = progress.completion.take() {
                drop(progress);
                completion.resolve(false);
            }
        }
    }
}

/// A queued message waiting to be packed into a packet.
#[derive(Debug)]
pub struct PendingMessage {
    pub msg_seq: SeqNum,
    pub pkt_type: PacketType,
    pub payload: Bytes,
    pub retry: RetryMode,
}

/// Per-message state kept until the message is acked or times out.
///
/// Created at enqueue time for any message with a retry mode or completion;
/// fire-and-forget messages with no completion never get an entry and are
/// retired the moment they are packed.
#[derive(Debug)]
pub(crate) struct Outstanding {
    pub pkt_type: PacketType,
    pub retry: RetryMode,
    /// Payload retained for re-sends; `None` for [`RetryMode::None`].
    pub payload: Option<Bytes>,
    pub completion: Option<Completion>,
    pub first_sent: Option<Instant>,
    pub last_sent: Option<Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn counting_completion(counter: Arc<AtomicI32>) -> Completion {
        Completion::Callback(Box::new(move |acked| {
            counter.fetch_add(if acked { 1 } else { -1 }, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_callback_resolve() {
        let counter = Arc::new(AtomicI32::new(0));
        counting_completion(counter.clone()).resolve(true);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_resolve() {
        let (tx, mut rx) = oneshot::channel();
        Completion::Channel(tx).resolve(true);
        assert!(matches!(rx.try_recv(), Ok(true)));
    }

    #[test]
    fn test_fragment_tracker_all_acked() {
        let counter = Arc::new(AtomicI32::new(0));
        let tracker = FragmentTracker::new(3, Some(counting_completion(counter.clone())));

        Completion::Fragment(tracker.clone()).resolve(true);
        Completion::Fragment(tracker.clone()).resolve(true);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        Completion::Fragment(tracker).resolve(true);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fragment_tracker_failure_fires_once() {
        let counter = Arc::new(AtomicI32::new(0));
        let tracker = FragmentTracker::new(3, Some(counting_completion(counter.clone())));

        Completion::Fragment(tracker.clone()).resolve(true);
        Completion::Fragment(tracker.clone()).resolve(false);
        assert_eq!(counter.load(Ordering::SeqCst), -1);

        // outcomes after resolution are ignored
        Completion::Fragment(tracker).resolve(true);
        assert_eq!(counter.load(Ordering::SeqCst), -1);
    }
}
