//! shmkit - Cross-process shared memory allocator, lists and queues
//!
//! Every link stored in a segment is a self-relative offset, so processes
//! that map the same segment at different addresses walk the same lists and
//! find the same named objects.

pub mod allocator;
pub mod config;
pub mod doorbell;
pub mod error;
pub mod list;
pub mod queue;
pub mod relptr;
pub mod segment;
pub mod sync;

pub use allocator::{
    Allocator, AllocatorStats, HeapAllocator, SharedAllocator, SharedAllocatorExt, ShmAllocator,
    ALIGN, BLOCK_HEADER_SIZE, HEADER_SIZE, MAX_NAME_LEN,
};
pub use config::{DoorbellConfig, SegmentConfig};
pub use doorbell::Doorbell;
pub use error::{Error, Result};
pub use list::{Linked, ListNode, SharedList};
pub use queue::{QueueStats, SharedQueue, MAX_QUEUE_NAME_LEN};
pub use relptr::RelPtr;
pub use segment::{HeapSegment, Segment, ShmSegment};
pub use sync::RawSharedMutex;
