//! Multi-producer single-consumer queue for the asynchronous send path.
//!
//! An intrusive linked list with a stub node. Producers link new nodes with
//! two atomic operations (tail exchange, then next-pointer publish) and never
//! block each other or the consumer. The consumer follows next-pointers from
//! the stub; a node whose link has not been published yet simply reads as an
//! empty queue and is picked up on the next drain pass.
//!
//! Ordering guarantee: the enqueues of any single producer are dequeued in
//! that producer's program order. No total order across producers is
//! maintained.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use bytes::Bytes;

struct Node {
    payload: Option<Bytes>,
    next: AtomicPtr<Node>,
}

impl Node {
    fn new(payload: Option<Bytes>) -> *mut Node {
        Box::into_raw(Box::new(Node {
            payload,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Unbounded lock-free FIFO of owned payloads.
///
/// `push` may be called from any number of threads concurrently. `pop` must
/// only ever be called from one thread at a time; the I/O loop is the single
/// consumer.
pub struct SendQueue {
    /// Consumer end. Always points at the current stub node whose `next`
    /// chain holds the pending payloads.
    head: AtomicPtr<Node>,
    /// Producer end; the most recently linked node.
    tail: AtomicPtr<Node>,
}

// The raw pointers are only ever shared through the atomic protocol above.
unsafe impl Send for SendQueue {}
unsafe impl Sync for SendQueue {}

impl SendQueue {
    pub fn new() -> Self {
        let stub = Node::new(None);
        Self {
            head: AtomicPtr::new(stub),
            tail: AtomicPtr::new(stub),
        }
    }

    /// Enqueues a payload. Lock-free; safe from any thread.
    pub fn push(&self, payload: Bytes) {
        let node = Node::new(Some(payload));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // Publishing the link hands the node to the consumer.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Dequeues the next payload, or `None` when no published node exists.
    ///
    /// Single-consumer: callers must guarantee no concurrent `pop`.
    pub fn pop(&self) -> Option<Bytes> {
        let head = self.head.load(Ordering::Relaxed);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }

        // The payload moves out of the successor, which becomes the new stub.
        let payload = unsafe { (*next).payload.take() };
        self.head.store(next, Ordering::Release);
        drop(unsafe { Box::from_raw(head) });

        payload
    }

    /// Whether a published node is waiting. Approximate under concurrency.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        unsafe { (*head).next.load(Ordering::Acquire) }.is_null()
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        // Free queued nodes, then the remaining stub.
        while self.pop().is_some() {}
        let stub = self.head.load(Ordering::Relaxed);
        drop(unsafe { Box::from_raw(stub) });
    }
}
