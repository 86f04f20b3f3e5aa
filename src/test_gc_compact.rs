//! End-to-end collection scenarios: a linked list surviving compaction,
//! and allocation pressure driving collection through the heap's
//! callback.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::compact::{CompactHeader, MarkCompact};
use crate::heap::BumpOrLargeHeap;

/// A 32-byte list node. `next` holds a raw managed pointer (or 0), which
/// is exactly what the conservative scan looks for.
#[repr(C)]
struct Node {
    next: usize,
    value: u64,
    _pad: [u64; 2],
}

const _: () = assert!(std::mem::size_of::<Node>() == 32);

static LIST_HEAD: AtomicUsize = AtomicUsize::new(0);

/// Building the list in its own frame keeps node pointers off the stack
/// the caller will still have live when it collects.
#[inline(never)]
fn build_list(heap: &BumpOrLargeHeap<CompactHeader>, n: usize) {
    let mut head = 0usize;
    for i in 0..n {
        let cap = heap.alloc(std::mem::size_of::<Node>()).unwrap();
        // safety: freshly allocated, correctly sized
        unsafe {
            (cap.base() as *mut Node).write(Node {
                next: head,
                value: i as u64,
                _pad: [0; 2],
            });
        }
        head = cap.base();
    }
    LIST_HEAD.store(head, Ordering::SeqCst);
}

#[inline(never)]
fn check_list(mut expect: u64) {
    let mut at = LIST_HEAD.load(Ordering::SeqCst);
    while at != 0 {
        // safety: the list is live; the collector keeps LIST_HEAD (a
        // global root) and every reachable node valid
        let node = unsafe { &*(at as *const Node) };
        assert_eq!(node.value, expect);
        expect = expect.wrapping_sub(1);
        at = node.next;
    }
    assert_eq!(expect, u64::MAX);
}

#[test]
fn mark_compact_collects_truncated_list() {
    let heap: BumpOrLargeHeap<CompactHeader> = BumpOrLargeHeap::create(8 * 1024 * 1024).unwrap();
    let gc = MarkCompact::new(&heap);

    build_list(&heap, 100);
    let stats = gc.collect();
    assert_eq!(stats.visited, 100);
    assert_eq!(stats.dead, 0);
    // the list is intact (pointers were rewritten consistently)
    check_list(99);

    // truncate: everything but the head becomes garbage
    let head_before = LIST_HEAD.load(Ordering::SeqCst);
    // safety: head node is live
    let head_value = unsafe {
        let node = &mut *(head_before as *mut Node);
        node.next = 0;
        node.value
    };

    let stats = gc.collect();
    assert_eq!(stats.visited, 1);
    assert_eq!(stats.dead, 99);

    // the root slot now names the packed location, at or below the old one
    let head_after = LIST_HEAD.load(Ordering::SeqCst);
    assert!(head_after <= head_before);
    // safety: the (moved) head is live
    unsafe {
        assert_eq!((*(head_after as *const Node)).value, head_value);
        assert_eq!((*(head_after as *const Node)).next, 0);
    }
    LIST_HEAD.store(0, Ordering::SeqCst);
}

static SURVIVOR: AtomicUsize = AtomicUsize::new(0);

#[test]
fn allocation_pressure_triggers_collection() {
    // the process-wide GC heap: allocation failure invokes the collector
    // through the heap's callback
    let p = crate::gc_alloc(64);
    assert!(!p.is_null());
    // safety: freshly allocated
    unsafe { (p as *mut u64).write(0xdec0de) };
    SURVIVOR.store(p as usize, Ordering::SeqCst);

    // churn through more than the whole heap; the callback has to fire
    // at least once for this to succeed
    let churn_bytes = crate::GC_HEAP_SIZE * 2;
    let each = 1024;
    for _ in 0..churn_bytes / each {
        let garbage = crate::gc_alloc(each);
        assert!(!garbage.is_null(), "collection failed to make room");
    }

    let q = SURVIVOR.load(Ordering::SeqCst) as *const u64;
    // safety: rooted via SURVIVOR the whole time
    unsafe {
        assert_eq!(q.read(), 0xdec0de);
    }
    SURVIVOR.store(0, Ordering::SeqCst);
}
