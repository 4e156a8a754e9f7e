//! Shared FIFO queue with a doorbell
//!
//! A queue is a [`SharedList`] named `<queue>.sl` plus a small header
//! registered under the queue's own name. Consumers block on a named FIFO
//! (see [`Doorbell`]) instead of polling the list.
//!
//! The doorbell is edge triggered: at most one signal byte is outstanding at
//! any time, no matter how many items are queued. A consumer that takes the
//! signal re-arms it while items remain, so the next waiter wakes up too.
//!
//! Lock order is queue header first, then list header. Nothing takes them the
//! other way round.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::allocator::{check_name, SharedAllocator};
use crate::config::DoorbellConfig;
use crate::doorbell::Doorbell;
use crate::list::{Linked, SharedList};
use crate::sync::RawSharedMutex;
use crate::{Error, Result};

/// Longest queue name. The name is also a file name component.
pub const MAX_QUEUE_NAME_LEN: usize = 128;

/// Queue header stored in the segment
#[repr(C)]
struct QueueHeader {
    lock: RawSharedMutex,
    /// Nonzero while a signal byte sits in the doorbell
    active: u32,
    writes: u64,
    reads: u64,
    high_water: u64,
}

/// Snapshot of a queue's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Doorbell signals written since creation
    pub writes: u64,
    /// Doorbell signals consumed since creation
    pub reads: u64,
    /// Whether a signal is outstanding
    pub active: bool,
    /// Deepest the queue has been
    pub high_water: u64,
    /// Items currently queued
    pub count: usize,
}

impl QueueStats {
    pub fn outstanding(&self) -> u64 {
        self.writes - self.reads
    }
}

/// Process-local handle on a queue living in a segment.
pub struct SharedQueue<'a, T: Linked> {
    alloc: &'a dyn SharedAllocator,
    header: NonNull<QueueHeader>,
    list: SharedList<'a, T>,
    doorbell: Doorbell,
    name: String,
}

fn list_name(name: &str) -> String {
    format!("{}.sl", name)
}

fn check_queue_name(name: &str) -> Result<()> {
    check_name(name, MAX_QUEUE_NAME_LEN)?;
    if name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidArgument(format!(
            "queue name {:?} is not a valid file name",
            name
        )));
    }
    Ok(())
}

impl<'a, T: Linked> SharedQueue<'a, T> {
    /// Create an empty queue, its list and its doorbell FIFO.
    ///
    /// Fails with [`Error::AlreadyRegistered`] if the name is taken in the
    /// segment, or with [`Error::Doorbell`] if the FIFO path already exists.
    pub fn create(
        name: &str,
        alloc: &'a dyn SharedAllocator,
        config: &DoorbellConfig,
    ) -> Result<Self> {
        check_queue_name(name)?;
        let lname = list_name(name);
        if alloc.find_registered_object(name).is_some() {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        if alloc.find_registered_object(&lname).is_some() {
            return Err(Error::AlreadyRegistered(lname));
        }

        let path = config.path_for(name);
        let doorbell = Doorbell::create(&path)?;

        let raw = match alloc.allocate(size_of::<QueueHeader>()) {
            Ok(raw) => raw,
            Err(e) => {
                let _ = Doorbell::remove(&path);
                return Err(e);
            }
        };
        let header = raw.cast::<QueueHeader>();
        unsafe {
            let hdr = header.as_ptr();
            ptr::write_bytes(hdr as *mut u8, 0, size_of::<QueueHeader>());
            (*hdr).lock.init();
        }

        if let Err(e) = alloc.register_object(name, raw) {
            unsafe {
                let _ = alloc.free(raw);
            }
            let _ = Doorbell::remove(&path);
            return Err(e);
        }

        let list = match SharedList::create(&lname, alloc) {
            Ok(list) => list,
            Err(e) => {
                let _ = alloc.deregister_object(name);
                unsafe {
                    let _ = alloc.free(raw);
                }
                let _ = Doorbell::remove(&path);
                return Err(e);
            }
        };

        debug!(name, path = %path.display(), "created shared queue");
        Ok(Self {
            alloc,
            header,
            list,
            doorbell,
            name: name.to_string(),
        })
    }

    /// Attach to a queue created by any process on the same segment and open
    /// its doorbell.
    ///
    /// If the header records an outstanding signal that the FIFO no longer
    /// holds, the signal is written off and the doorbell re-armed for the
    /// items still queued.
    pub fn attach(
        name: &str,
        alloc: &'a dyn SharedAllocator,
        config: &DoorbellConfig,
    ) -> Result<Self> {
        check_queue_name(name)?;
        let raw = alloc
            .find_registered_object(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let list = SharedList::attach(&list_name(name), alloc)?;
        let path = config.path_for(name);
        let doorbell = Doorbell::open(&path)?;

        let queue = Self {
            alloc,
            header: raw.cast(),
            list,
            doorbell,
            name: name.to_string(),
        };
        queue.prime()?;
        debug!(name, path = %path.display(), "attached shared queue");
        Ok(queue)
    }

    fn prime(&self) -> Result<()> {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        unsafe {
            if (*hdr).active != 0 && !self.doorbell.is_pending()? {
                warn!(name = %self.name, "doorbell signal lost, re-arming");
                (*hdr).active = 0;
                (*hdr).reads += 1;
            }
            self.update_doorbell()
        }
    }

    /// Destroy the list, deregister and free the header, and unlink the FIFO.
    /// Queued records are left to the caller.
    pub fn destroy(self) -> Result<()> {
        let Self {
            alloc,
            header,
            list,
            doorbell,
            name,
        } = self;
        list.destroy()?;
        alloc.deregister_object(&name)?;
        unsafe { alloc.free(header.cast())? };
        match Doorbell::remove(doorbell.path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(name = %name, "destroyed shared queue");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doorbell_path(&self) -> PathBuf {
        self.doorbell.path().to_path_buf()
    }

    #[inline]
    fn hdr(&self) -> *mut QueueHeader {
        self.header.as_ptr()
    }

    /// Ring if items are queued and no signal is outstanding. Caller holds
    /// the queue lock.
    unsafe fn update_doorbell(&self) -> Result<()> {
        let hdr = self.hdr();
        let count = self.list.count();
        (*hdr).high_water = (*hdr).high_water.max(count as u64);
        if (*hdr).active == 0 && count > 0 {
            self.doorbell.ring()?;
            (*hdr).active = 1;
            (*hdr).writes += 1;
        }
        Ok(())
    }

    /// Append `node` and ring the doorbell if nobody has been told yet.
    ///
    /// If ringing fails the node stays queued and the error is returned.
    ///
    /// # Safety
    ///
    /// `node` must be a live record allocated from this queue's allocator and
    /// must not currently be linked into any list.
    pub unsafe fn enqueue(&self, node: NonNull<T>) -> Result<()> {
        let hdr = self.hdr();
        let _guard = (*hdr).lock.lock();
        self.list.add_tail(node)?;
        self.update_doorbell()
    }

    /// Caller holds the queue lock and has just consumed the signal byte.
    unsafe fn take_locked(&self) -> Result<NonNull<T>> {
        let hdr = self.hdr();
        (*hdr).active = 0;
        (*hdr).reads += 1;
        let node = self.list.pop_head();
        self.update_doorbell()?;
        node.ok_or(Error::QueueEmpty)
    }

    /// Block until an item is available and remove it from the head.
    pub fn dequeue(&self) -> Result<NonNull<T>> {
        loop {
            self.doorbell.wait_readable(None)?;
            let hdr = self.hdr();
            let _guard = unsafe { (*hdr).lock.lock() };
            // Another consumer may have taken the signal between poll and lock.
            if self.doorbell.try_consume()? {
                return unsafe { self.take_locked() };
            }
        }
    }

    /// Like [`SharedQueue::dequeue`], but gives up after `timeout` and
    /// returns `Ok(None)`.
    pub fn dequeue_timed(&self, timeout: Duration) -> Result<Option<NonNull<T>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if self.doorbell.wait_readable(Some(remaining))? {
                let hdr = self.hdr();
                let _guard = unsafe { (*hdr).lock.lock() };
                if self.doorbell.try_consume()? {
                    return unsafe { self.take_locked() }.map(Some);
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Readable handle for an external event loop. It becomes readable when
    /// the queue has items; call [`SharedQueue::dequeue`] to take one.
    pub fn notify_handle(&self) -> BorrowedFd<'_> {
        self.doorbell.as_fd()
    }

    pub fn count(&self) -> usize {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        self.list.count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Visit every queued record from head to tail.
    pub fn for_each<F>(&self, visit: F)
    where
        F: FnMut(&T),
    {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        self.list.for_each(visit);
    }

    pub fn stats(&self) -> QueueStats {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        unsafe {
            QueueStats {
                writes: (*hdr).writes,
                reads: (*hdr).reads,
                active: (*hdr).active != 0,
                high_water: (*hdr).high_water,
                count: self.list.count(),
            }
        }
    }

    pub fn dump_stats(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let s = self.stats();
        writeln!(out, "Queue[{}]", self.name)?;
        writeln!(out, "  doorbell writes: {}", s.writes)?;
        writeln!(out, "  doorbell reads: {}", s.reads)?;
        writeln!(out, "  doorbell active: {}", s.active)?;
        writeln!(out, "  high water: {}", s.high_water)?;
        writeln!(out, "  count: {}", s.count)
    }
}

impl<T: Linked> AsFd for SharedQueue<'_, T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.notify_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{HeapAllocator, SharedAllocatorExt};
    use crate::list::ListNode;

    #[repr(C)]
    struct Msg {
        node: ListNode,
        seq: u32,
    }

    unsafe impl Linked for Msg {}

    fn doorbell_config() -> DoorbellConfig {
        DoorbellConfig {
            dir: std::env::temp_dir(),
        }
    }

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("shmkit_q_{}_{}_{}", tag, std::process::id(), ts)
    }

    fn msg(alloc: &HeapAllocator, seq: u32) -> NonNull<Msg> {
        alloc
            .allocate_value(Msg {
                node: ListNode::new(),
                seq,
            })
            .unwrap()
    }

    #[test]
    fn test_edge_triggered_doorbell() {
        let alloc = HeapAllocator::new(16 * 1024).unwrap();
        let cfg = doorbell_config();
        let name = unique_name("edge");
        let q: SharedQueue<'_, Msg> = SharedQueue::create(&name, &alloc, &cfg).unwrap();

        for seq in 0..5 {
            unsafe { q.enqueue(msg(&alloc, seq)).unwrap() };
        }
        let s = q.stats();
        assert_eq!(s.writes, 1);
        assert_eq!(s.reads, 0);
        assert!(s.active);
        assert_eq!(s.count, 5);
        assert_eq!(s.high_water, 5);

        for seq in 0..5 {
            let m = q.dequeue().unwrap();
            assert_eq!(unsafe { m.as_ref().seq }, seq);
            assert!(q.stats().outstanding() <= 1);
            unsafe { alloc.free(m.cast()).unwrap() };
        }
        let s = q.stats();
        assert_eq!(s.writes, 5);
        assert_eq!(s.reads, 5);
        assert!(!s.active);
        assert_eq!(s.count, 0);

        q.destroy().unwrap();
        assert_eq!(alloc.blocks_allocated(), 0);
    }

    #[test]
    fn test_dequeue_timed_on_empty() {
        let alloc = HeapAllocator::new(8 * 1024).unwrap();
        let cfg = doorbell_config();
        let name = unique_name("timed");
        let q: SharedQueue<'_, Msg> = SharedQueue::create(&name, &alloc, &cfg).unwrap();

        let start = Instant::now();
        assert!(q.dequeue_timed(Duration::from_millis(20)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));

        unsafe { q.enqueue(msg(&alloc, 9)).unwrap() };
        let m = q.dequeue_timed(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(unsafe { m.as_ref().seq }, 9);
        q.destroy().unwrap();
    }

    #[test]
    fn test_attach_shares_items() {
        let alloc = HeapAllocator::new(8 * 1024).unwrap();
        let cfg = doorbell_config();
        let name = unique_name("attach");
        let producer: SharedQueue<'_, Msg> = SharedQueue::create(&name, &alloc, &cfg).unwrap();
        let consumer: SharedQueue<'_, Msg> = SharedQueue::attach(&name, &alloc, &cfg).unwrap();

        unsafe {
            producer.enqueue(msg(&alloc, 1)).unwrap();
            producer.enqueue(msg(&alloc, 2)).unwrap();
        }
        assert_eq!(consumer.count(), 2);
        let m = consumer.dequeue().unwrap();
        assert_eq!(unsafe { m.as_ref().seq }, 1);
        let m = producer.dequeue().unwrap();
        assert_eq!(unsafe { m.as_ref().seq }, 2);
        drop(consumer);
        producer.destroy().unwrap();
    }

    #[test]
    fn test_attach_rearms_lost_signal() {
        let alloc = HeapAllocator::new(8 * 1024).unwrap();
        let cfg = doorbell_config();
        let name = unique_name("prime");
        let q: SharedQueue<'_, Msg> = SharedQueue::create(&name, &alloc, &cfg).unwrap();
        unsafe { q.enqueue(msg(&alloc, 3)).unwrap() };

        // Steal the byte behind the queue's back.
        let raw = Doorbell::open(&cfg.path_for(&name)).unwrap();
        assert!(raw.try_consume().unwrap());
        assert!(q.stats().active);

        let attached: SharedQueue<'_, Msg> = SharedQueue::attach(&name, &alloc, &cfg).unwrap();
        let s = attached.stats();
        assert_eq!(s.writes, 2);
        assert_eq!(s.reads, 1);
        let m = attached.dequeue_timed(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(unsafe { m.as_ref().seq }, 3);
        drop(attached);
        q.destroy().unwrap();
    }

    #[test]
    fn test_create_rejects_bad_names_and_duplicates() {
        let alloc = HeapAllocator::new(8 * 1024).unwrap();
        let cfg = doorbell_config();
        assert!(matches!(
            SharedQueue::<Msg>::create("a/b", &alloc, &cfg),
            Err(Error::InvalidArgument(_))
        ));
        let long = "q".repeat(MAX_QUEUE_NAME_LEN + 1);
        assert!(matches!(
            SharedQueue::<Msg>::create(&long, &alloc, &cfg),
            Err(Error::InvalidArgument(_))
        ));

        let name = unique_name("dup");
        let q: SharedQueue<'_, Msg> = SharedQueue::create(&name, &alloc, &cfg).unwrap();
        assert!(matches!(
            SharedQueue::<Msg>::create(&name, &alloc, &cfg),
            Err(Error::AlreadyRegistered(_))
        ));
        assert!(matches!(
            SharedQueue::<Msg>::attach("missing", &alloc, &cfg),
            Err(Error::NotFound(_))
        ));
        q.destroy().unwrap();
        assert!(!cfg.path_for(&name).exists());
    }

    #[test]
    fn test_dump_stats() {
        let alloc = HeapAllocator::new(8 * 1024).unwrap();
        let cfg = doorbell_config();
        let name = unique_name("dump");
        let q: SharedQueue<'_, Msg> = SharedQueue::create(&name, &alloc, &cfg).unwrap();
        unsafe { q.enqueue(msg(&alloc, 0)).unwrap() };

        let mut out = Vec::new();
        q.dump_stats(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("doorbell writes: 1"));
        assert!(text.contains("doorbell active: true"));
        assert!(text.contains("count: 1"));
        q.destroy().unwrap();
    }
}
