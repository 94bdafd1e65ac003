//! In-process typed publish/subscribe. One topic per event kind;
//! publishing runs every subscriber inline on the publisher's thread, in
//! registration order. This is wiring, not a queue: subscribers must be
//! non-blocking and hand long work to their own workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use mcpspy_protocol::{
    FsAggregatedEvent, HttpRequestEvent, HttpResponseEvent, McpEvent, RawDataEvent, SseEvent,
    TlsPayloadInput,
};

/// A library observation, decoded from the kernel event.
#[derive(Debug, Clone)]
pub struct LibraryEvent {
    pub pid: u32,
    pub comm: String,
    pub inode: u64,
    pub mnt_ns_id: u32,
    pub path: std::path::PathBuf,
}

/// An SSL_free notification, decoded from the kernel event.
#[derive(Debug, Clone)]
pub struct TlsFreeEvent {
    pub pid: u32,
    pub ssl_ctx: u64,
}

/// Handle returned by [`Topic::subscribe`]; pass to
/// [`Topic::unsubscribe`] to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Handler<E> = Box<dyn Fn(&E) + Send + Sync>;

/// A single-event-kind topic.
pub struct Topic<E> {
    subscribers: RwLock<Vec<(SubscriptionId, Handler<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for Topic<E> {
    fn default() -> Self {
        Topic {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> Topic<E> {
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap()
            .push((id, Box::new(handler)));
        id
    }

    /// Safe to call concurrently with publish: the unsubscribe blocks
    /// until in-flight deliveries on other threads drain.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().unwrap().retain(|(s, _)| *s != id);
    }

    /// Deliver `event` to every subscriber, in registration order, on
    /// the calling thread. The event is borrowed by each handler for the
    /// duration of its call only.
    pub fn publish(&self, event: &E) {
        let subscribers = self.subscribers.read().unwrap();
        for (_, handler) in subscribers.iter() {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

/// All topics of the pipeline.
#[derive(Default)]
pub struct EventBus {
    /// Raw stdio payloads from the kernel (stage A -> stage D).
    pub raw_data: Topic<RawDataEvent>,
    /// Library observations (stage A -> stage B).
    pub library: Topic<LibraryEvent>,
    /// TLS plaintext payloads (stage A -> stage C).
    pub tls_payload: Topic<TlsPayloadInput>,
    /// TLS session teardowns (stage A -> stage C).
    pub tls_free: Topic<TlsFreeEvent>,
    /// Aggregated stdio JSON (stage D -> stage E).
    pub fs_aggregated: Topic<FsAggregatedEvent>,
    /// Reassembled HTTP requests (stage C -> stage E).
    pub http_request: Topic<HttpRequestEvent>,
    /// Reassembled HTTP responses (stage C -> stage E).
    pub http_response: Topic<HttpResponseEvent>,
    /// SSE records (stage C -> stage E).
    pub sse: Topic<SseEvent>,
    /// Correlated MCP events (stage E -> consumers).
    pub mcp: Topic<McpEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(EventBus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn publish_reaches_subscribers_in_order() {
        let topic: Topic<u32> = Topic::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        topic.subscribe(move |v| o1.lock().unwrap().push(("first", *v)));
        let o2 = order.clone();
        topic.subscribe(move |v| o2.lock().unwrap().push(("second", *v)));

        topic.publish(&7);
        assert_eq!(
            order.lock().unwrap().as_slice(),
            &[("first", 7), ("second", 7)]
        );
    }

    #[test]
    fn unsubscribe_detaches() {
        let topic: Topic<u32> = Topic::default();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = topic.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        topic.publish(&1);
        topic.unsubscribe(id);
        topic.publish(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let topic: Topic<u32> = Topic::default();
        topic.publish(&1);
    }

    #[test]
    fn publish_from_multiple_threads() {
        let topic: Arc<Topic<u32>> = Arc::new(Topic::default());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        topic.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = topic.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    t.publish(&i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 400);
    }
}
