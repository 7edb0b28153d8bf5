//! Recency lists for the buffer cache buckets.
//!
//! Every bucket is a circular doubly linked list threaded through index
//! links. Nodes `0..nbuf` are buffers; node `nbuf + i` is the sentinel head
//! of bucket `i`. `head.next` is the most recently used buffer and
//! `head.prev` the least recently used.
//!
//! The links of a node may only be touched while holding the lock of the
//! bucket the node currently belongs to. Operations take `&mut Bucket`,
//! which a caller can only have through that bucket's lock guard.

use std::sync::atomic::{AtomicUsize, Ordering};

/// List header for one bucket. Lives inside the bucket's spin lock.
#[derive(Debug)]
pub(crate) struct Bucket {
    /// Sentinel node index.
    head: usize,
    /// Number of buffers linked into this bucket.
    len: usize,
}

impl Bucket {
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

/// Link storage for all buffers and bucket heads.
#[derive(Debug)]
pub(crate) struct LruLinks {
    prev: Box<[AtomicUsize]>,
    next: Box<[AtomicUsize]>,
    nbuf: usize,
}

// Links are only read or written under the owning bucket's lock, which
// provides the ordering; the atomics only make the shared storage safe.
const ORDER: Ordering = Ordering::Relaxed;

impl LruLinks {
    /// Creates links for `nbuf` buffers and `nbucket` empty buckets.
    pub(crate) fn new(nbuf: usize, nbucket: usize) -> (Self, Vec<Bucket>) {
        let nodes = nbuf + nbucket;
        let links = Self {
            prev: (0..nodes).map(AtomicUsize::new).collect(),
            next: (0..nodes).map(AtomicUsize::new).collect(),
            nbuf,
        };
        let buckets = (0..nbucket)
            .map(|i| Bucket {
                head: nbuf + i,
                len: 0,
            })
            .collect();
        (links, buckets)
    }

    fn prev(&self, node: usize) -> usize {
        self.prev[node].load(ORDER)
    }

    fn next(&self, node: usize) -> usize {
        self.next[node].load(ORDER)
    }

    fn set_prev(&self, node: usize, to: usize) {
        self.prev[node].store(to, ORDER);
    }

    fn set_next(&self, node: usize, to: usize) {
        self.next[node].store(to, ORDER);
    }

    /// Removes buffer `b` from `bucket`.
    pub(crate) fn unlink(&self, bucket: &mut Bucket, b: usize) {
        debug_assert!(b < self.nbuf);
        let (prev, next) = (self.prev(b), self.next(b));
        self.set_prev(next, prev);
        self.set_next(prev, next);
        bucket.len -= 1;
    }

    /// Links buffer `b` at the most recently used end of `bucket`.
    pub(crate) fn push_front(&self, bucket: &mut Bucket, b: usize) {
        debug_assert!(b < self.nbuf);
        let head = bucket.head;
        let first = self.next(head);
        self.set_next(b, first);
        self.set_prev(b, head);
        self.set_prev(first, b);
        self.set_next(head, b);
        bucket.len += 1;
    }

    /// Links buffer `b` at the least recently used end of `bucket`.
    pub(crate) fn push_back(&self, bucket: &mut Bucket, b: usize) {
        debug_assert!(b < self.nbuf);
        let head = bucket.head;
        let last = self.prev(head);
        self.set_prev(b, last);
        self.set_next(b, head);
        self.set_next(last, b);
        self.set_prev(head, b);
        bucket.len += 1;
    }

    /// Moves `b`, already in `bucket`, to the most recently used end.
    pub(crate) fn move_to_front(&self, bucket: &mut Bucket, b: usize) {
        self.unlink(bucket, b);
        self.push_front(bucket, b);
    }

    /// Moves `b`, already in `bucket`, to the least recently used end.
    pub(crate) fn move_to_back(&self, bucket: &mut Bucket, b: usize) {
        self.unlink(bucket, b);
        self.push_back(bucket, b);
    }

    /// Buffers of `bucket` from most to least recently used.
    pub(crate) fn iter_mru<'a>(&'a self, bucket: &'a Bucket) -> Iter<'a> {
        Iter {
            links: self,
            head: bucket.head,
            cur: self.next(bucket.head),
            forward: true,
        }
    }

    /// Buffers of `bucket` from least to most recently used.
    pub(crate) fn iter_lru<'a>(&'a self, bucket: &'a Bucket) -> Iter<'a> {
        Iter {
            links: self,
            head: bucket.head,
            cur: self.prev(bucket.head),
            forward: false,
        }
    }
}

/// Walks one bucket's list.
pub(crate) struct Iter<'a> {
    links: &'a LruLinks,
    head: usize,
    cur: usize,
    forward: bool,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == self.head {
            return None;
        }
        let node = self.cur;
        self.cur = if self.forward {
            self.links.next(node)
        } else {
            self.links.prev(node)
        };
        Some(node)
    }
}
