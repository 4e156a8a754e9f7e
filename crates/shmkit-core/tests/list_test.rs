//! Shared list traversal across relocated and shared mappings

use std::ptr::NonNull;

use shmkit_core::{
    HeapAllocator, HeapSegment, Linked, ListNode, Segment, SharedAllocator, SharedAllocatorExt,
    SharedList, ShmAllocator, ShmSegment,
};

#[repr(C)]
struct Record {
    node: ListNode,
    id: u32,
    label: [u8; 8],
}

unsafe impl Linked for Record {}

fn record(alloc: &dyn SharedAllocator, id: u32) -> NonNull<Record> {
    let mut label = [0u8; 8];
    label[..4].copy_from_slice(&id.to_le_bytes());
    alloc
        .allocate_value(Record {
            node: ListNode::new(),
            id,
            label,
        })
        .unwrap()
}

fn walk(list: &SharedList<'_, Record>) -> Vec<u32> {
    let mut ids = Vec::new();
    let mut cur = list.head();
    while let Some(n) = cur {
        ids.push(unsafe { n.as_ref().id });
        cur = unsafe { list.next(n) };
    }
    ids
}

#[test]
fn test_list_survives_relocation() {
    let alloc = HeapAllocator::new(8192).unwrap();
    let list: SharedList<'_, Record> = SharedList::create("records", &alloc).unwrap();
    for id in [3, 1, 4, 1, 5, 9, 2, 6] {
        unsafe { list.add_tail(record(&alloc, id)).unwrap() };
    }
    let expected = walk(&list);
    assert_eq!(expected, vec![3, 1, 4, 1, 5, 9, 2, 6]);

    let moved_alloc =
        HeapAllocator::attach_segment(HeapSegment::from_bytes(&alloc.snapshot()).unwrap())
            .unwrap();
    assert_ne!(
        alloc.segment().as_ptr() as usize,
        moved_alloc.segment().as_ptr() as usize
    );
    let moved: SharedList<'_, Record> = SharedList::attach("records", &moved_alloc).unwrap();

    assert_eq!(walk(&moved), expected);
    assert_eq!(moved.count(), 8);
    let tail = moved.tail().unwrap();
    assert_eq!(unsafe { tail.as_ref().id }, 6);
    assert!(moved_alloc.contains(tail.as_ptr() as *const u8));
    assert!(!alloc.contains(tail.as_ptr() as *const u8));

    let nine = moved.find(|r| r.id == 9).unwrap();
    assert_eq!(unsafe { nine.as_ref().label[..4].to_vec() }, 9u32.to_le_bytes());

    // Mutating the copy leaves the source alone.
    unsafe { moved.remove(nine).unwrap() };
    assert_eq!(walk(&moved), vec![3, 1, 4, 1, 5, 2, 6]);
    assert_eq!(walk(&list), expected);
}

#[test]
fn test_list_shared_between_mappings() {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    let key = (std::process::id() << 16) ^ ts ^ 0x4c49_5354;

    let first = ShmAllocator::create(32 * 1024, key).unwrap();
    let second = ShmAllocator::attach(key).unwrap();

    let writer: SharedList<'_, Record> = SharedList::create("events", &first).unwrap();
    let reader: SharedList<'_, Record> = SharedList::attach("events", &second).unwrap();

    unsafe {
        writer.add_tail(record(&first, 10)).unwrap();
        writer.add_head(record(&first, 5)).unwrap();
    }
    // Nodes allocated through the second mapping link in just the same.
    unsafe { reader.add_tail(record(&second, 20)).unwrap() };

    assert_eq!(walk(&reader), vec![5, 10, 20]);
    assert_eq!(walk(&writer), vec![5, 10, 20]);

    while let Some(n) = reader.pop_head() {
        unsafe { second.free(n.cast()).unwrap() };
    }
    assert!(writer.is_empty());

    writer.destroy().unwrap();
    assert_eq!(second.blocks_allocated(), 0);

    drop(reader);
    drop(second);
    drop(first);
    ShmSegment::remove(key).unwrap();
}

#[test]
fn test_destroy_unlinks_without_freeing_records() {
    let alloc = HeapAllocator::new(4096).unwrap();
    let list: SharedList<'_, Record> = SharedList::create("scratch", &alloc).unwrap();
    let nodes: Vec<_> = (0..3).map(|i| record(&alloc, i)).collect();
    for &n in &nodes {
        unsafe { list.add_tail(n).unwrap() };
    }
    list.destroy().unwrap();
    assert_eq!(alloc.blocks_allocated(), 3);

    // Records can be linked into a new list after the old one is gone.
    let again: SharedList<'_, Record> = SharedList::create("scratch", &alloc).unwrap();
    for &n in nodes.iter().rev() {
        unsafe { again.add_tail(n).unwrap() };
    }
    assert_eq!(walk(&again), vec![2, 1, 0]);
}
