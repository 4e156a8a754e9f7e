//! Job consumer - attaches to the producer's queue and drains it
//!
//! ```bash
//! RUST_LOG=info cargo run --example consumer
//! ```

use std::time::Duration;

use shmkit_core::{
    DoorbellConfig, Linked, ListNode, SegmentConfig, SharedAllocator, SharedQueue, ShmAllocator,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const QUEUE_NAME: &str = "jobs";

/// Must match the producer's definition.
#[repr(C)]
struct Job {
    node: ListNode,
    id: u32,
    text: [u8; 48],
    len: u8,
}

unsafe impl Linked for Job {}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let seg_cfg = SegmentConfig::from_env()?;
    let db_cfg = DoorbellConfig::from_env();

    let alloc = ShmAllocator::attach(seg_cfg.key)?;
    let queue: SharedQueue<'_, Job> = SharedQueue::attach(QUEUE_NAME, &alloc, &db_cfg)?;
    info!(queued = queue.count(), "attached to queue");

    let mut received = 0;
    while let Some(job) = queue.dequeue_timed(Duration::from_secs(5))? {
        let (id, text) = unsafe {
            let j = job.as_ref();
            (j.id, String::from_utf8_lossy(&j.text[..j.len as usize]).into_owned())
        };
        info!(id, %text, "dequeued");
        unsafe { alloc.free(job.cast())? };
        received += 1;
    }

    info!(received, "no job for 5s, exiting");
    queue.dump_stats(&mut std::io::stdout())?;
    Ok(())
}
