//! Cross-process tests
//!
//! Uses fork() so each side is a genuinely separate process with its own
//! mapping of the segment.

#[cfg(all(test, feature = "integration"))]
mod integration {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};
    use std::ptr::NonNull;
    use std::thread;
    use std::time::Duration;

    use shmkit_core::{
        DoorbellConfig, Linked, ListNode, SharedAllocator, SharedAllocatorExt, SharedQueue,
        ShmAllocator, ShmSegment,
    };

    #[repr(C)]
    struct Job {
        node: ListNode,
        seq: u32,
    }

    unsafe impl Linked for Job {}

    fn unique_key() -> u32 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        (std::process::id() << 16) ^ ts
    }

    fn unique_name(tag: &str) -> String {
        format!("shmkit_it_{}_{}", tag, unique_key())
    }

    fn is_exit_success(status: WaitStatus) -> bool {
        matches!(status, WaitStatus::Exited(_, code) if code == 0)
    }

    /// Keep trying until the other process has set things up.
    fn retry<T, E: std::fmt::Debug>(mut f: impl FnMut() -> Result<T, E>) -> T {
        let mut attempts = 0;
        loop {
            match f() {
                Ok(v) => break v,
                Err(e) => {
                    attempts += 1;
                    if attempts > 40 {
                        panic!("gave up after {} attempts: {:?}", attempts, e);
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    /// A value registered by the child is found by the parent at its own
    /// mapping address.
    #[test]
    fn test_cross_process_registry() {
        let key = unique_key();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let alloc = ShmAllocator::create(64 * 1024, key).unwrap();
                let v = alloc.allocate_value(0xfeed_f00d_u64).unwrap();
                alloc.register_object("answer", v.cast()).unwrap();
                thread::sleep(Duration::from_millis(500));
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                let alloc = retry(|| ShmAllocator::attach(key));
                let found: NonNull<u64> = retry(|| {
                    alloc
                        .find_registered_object("answer")
                        .ok_or("not registered yet")
                })
                .cast();
                assert_eq!(unsafe { *found.as_ptr() }, 0xfeed_f00d);
                assert!(alloc.contains(found.as_ptr() as *const u8));

                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status));
                drop(alloc);
                ShmSegment::remove(key).unwrap();
            }
        }
    }

    /// Child enqueues, parent blocks on the doorbell and receives in order.
    #[test]
    fn test_cross_process_queue() {
        let key = unique_key() ^ 0x5155_4555;
        let name = unique_name("queue");
        let cfg = DoorbellConfig {
            dir: std::env::temp_dir(),
        };

        let alloc = ShmAllocator::create(64 * 1024, key).unwrap();
        let queue: SharedQueue<'_, Job> = SharedQueue::create(&name, &alloc, &cfg).unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let alloc = ShmAllocator::attach(key).unwrap();
                let q: SharedQueue<'_, Job> = SharedQueue::attach(&name, &alloc, &cfg).unwrap();
                for seq in 0..5 {
                    let j = alloc
                        .allocate_value(Job {
                            node: ListNode::new(),
                            seq,
                        })
                        .unwrap();
                    unsafe { q.enqueue(j).unwrap() };
                    thread::sleep(Duration::from_millis(20));
                }
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                let mut got = Vec::new();
                for _ in 0..5 {
                    let j = queue
                        .dequeue_timed(Duration::from_secs(5))
                        .unwrap()
                        .expect("child never enqueued");
                    got.push(unsafe { j.as_ref().seq });
                    unsafe { alloc.free(j.cast()).unwrap() };
                }
                assert_eq!(got, vec![0, 1, 2, 3, 4]);

                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status));

                let stats = queue.stats();
                assert_eq!(stats.writes, 5);
                assert_eq!(stats.reads, 5);
                queue.destroy().unwrap();
                assert_eq!(alloc.blocks_allocated(), 0);
                drop(alloc);
                ShmSegment::remove(key).unwrap();
            }
        }
    }
}
