//! Job producer - creates the segment and a queue, then enqueues jobs
//!
//! Start this first, then run the consumer in another terminal:
//! ```bash
//! RUST_LOG=info cargo run --example producer -- 10
//! RUST_LOG=info cargo run --example consumer
//! ```
//!
//! `SHMKIT_KEY`, `SHMKIT_SIZE` and `SHMKIT_DOORBELL_DIR` override the
//! defaults. The producer tears everything down once the queue is drained.

use std::thread;
use std::time::{Duration, Instant};

use shmkit_core::{
    DoorbellConfig, Linked, ListNode, SegmentConfig, SharedAllocator, SharedAllocatorExt,
    SharedQueue, ShmAllocator, ShmSegment,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const QUEUE_NAME: &str = "jobs";

/// Must match the consumer's definition.
#[allow(dead_code)]
#[repr(C)]
struct Job {
    node: ListNode,
    id: u32,
    text: [u8; 48],
    len: u8,
}

unsafe impl Linked for Job {}

impl Job {
    fn new(id: u32, msg: &str) -> Self {
        let mut text = [0u8; 48];
        let len = msg.len().min(text.len());
        text[..len].copy_from_slice(&msg.as_bytes()[..len]);
        Self {
            node: ListNode::new(),
            id,
            text,
            len: len as u8,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let count: u32 = std::env::args()
        .nth(1)
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(10);

    let seg_cfg = SegmentConfig::from_env()?;
    let db_cfg = DoorbellConfig::from_env();

    let alloc = ShmAllocator::create(seg_cfg.size, seg_cfg.key)?;
    info!(key = seg_cfg.key, size = seg_cfg.size, "segment created");

    let queue: SharedQueue<'_, Job> = SharedQueue::create(QUEUE_NAME, &alloc, &db_cfg)?;
    info!(path = %queue.doorbell_path().display(), "queue ready");

    for id in 0..count {
        let text = format!("job #{} from pid {}", id, std::process::id());
        let job = alloc.allocate_value(Job::new(id, &text))?;
        unsafe { queue.enqueue(job)? };
        info!(id, queued = queue.count(), "enqueued");
        thread::sleep(Duration::from_millis(200));
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while !queue.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
    }
    queue.dump_stats(&mut std::io::stdout())?;
    alloc.dump(&mut std::io::stdout())?;

    // Whatever the consumer left behind goes back to the segment.
    while let Some(job) = queue.dequeue_timed(Duration::ZERO)? {
        unsafe { alloc.free(job.cast())? };
    }
    queue.destroy()?;
    alloc.destroy();
    ShmSegment::remove(seg_cfg.key)?;
    info!("segment removed");
    Ok(())
}
