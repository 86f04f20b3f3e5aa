//! Stopping and starting the world.
//!
//! There is no portable "suspend every thread" primitive, so the
//! collector uses signal-driven checkpoints: mutator threads register
//! themselves, and `stop_the_world` delivers a signal whose handler
//! records the thread's stack pointer and spins until the world restarts.
//! A suspended thread's register contents end up in its signal frame, on
//! the very stack the collector scans, so no register is lost to the
//! conservative scan.
//!
//! Threads that never register are invisible to the collector and must
//! not hold managed pointers across a collection; that is the same
//! contract a platform thread-suspend primitive would impose, made
//! explicit.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::cap::Capability;

#[cfg(target_os = "linux")]
const SUSPEND_SIGNAL: libc::c_int = libc::SIGPWR;
#[cfg(not(target_os = "linux"))]
const SUSPEND_SIGNAL: libc::c_int = libc::SIGUSR2;

struct MutatorState {
    tid: libc::pthread_t,
    /// Highest address of the thread's stack.
    stack_top: usize,
    /// Stack pointer recorded by the suspend handler; 0 while running.
    saved_sp: AtomicUsize,
}

// safety: pthread_t is an opaque id, shared read-only after registration
unsafe impl Send for MutatorState {}
unsafe impl Sync for MutatorState {}

static MUTATORS: Mutex<Vec<Arc<MutatorState>>> = Mutex::new(Vec::new());
static WORLD_STOPPED: AtomicBool = AtomicBool::new(false);
static SUSPEND_ACKS: AtomicUsize = AtomicUsize::new(0);
/// Serializes whole stop..start windows across independent collectors.
static STW_OWNER: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// This thread's registry entry, for the signal handler.
    static CURRENT: Cell<*const MutatorState> = const { Cell::new(std::ptr::null()) };
    /// Nesting depth of allocator critical sections on this thread.
    static CRITICAL_DEPTH: Cell<usize> = const { Cell::new(0) };
    /// A suspend request arrived while inside a critical section.
    static STOP_DEFERRED: Cell<bool> = const { Cell::new(false) };
}

/// Park the current thread until the world restarts, publishing its
/// stack pointer for the collector's scan.
fn park_current() {
    let state = CURRENT.with(|c| c.get());
    if state.is_null() {
        return;
    }
    // safety: the Arc in the registry keeps this alive while registered
    let state = unsafe { &*state };
    let sp = approximate_sp();
    // order: release, the collector reads saved_sp after seeing the ack
    state.saved_sp.store(sp, Ordering::Release);
    SUSPEND_ACKS.fetch_add(1, Ordering::Release);
    while WORLD_STOPPED.load(Ordering::Acquire) {
        // only atomics and sched_yield in here; both are signal safe
        unsafe { libc::sched_yield() };
    }
    state.saved_sp.store(0, Ordering::Relaxed);
    SUSPEND_ACKS.fetch_sub(1, Ordering::Release);
}

extern "C" fn suspend_handler(_: libc::c_int) {
    // A thread caught inside an allocator critical section must not park
    // there: the collector takes the same locks to walk the heap, so
    // parking would deadlock it. Defer; the critical-section exit parks.
    if CRITICAL_DEPTH.with(|d| d.get()) > 0 {
        STOP_DEFERRED.with(|f| f.set(true));
        return;
    }
    park_current();
}

/// RAII marker for an allocator critical section (a held chunk lock).
/// While one is live the thread cannot be parked; a deferred suspension
/// fires when the outermost section ends.
pub struct CriticalSection(());

pub fn enter_critical() -> CriticalSection {
    CRITICAL_DEPTH.with(|d| d.set(d.get() + 1));
    CriticalSection(())
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let depth = CRITICAL_DEPTH.with(|d| {
            let v = d.get() - 1;
            d.set(v);
            v
        });
        if depth == 0 && STOP_DEFERRED.with(|f| f.replace(false)) {
            park_current();
        }
    }
}

fn install_handler() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // safety: installing a handler that only touches atomics
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = suspend_handler as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            let rc = libc::sigaction(SUSPEND_SIGNAL, &action, std::ptr::null_mut());
            assert_eq!(rc, 0, "failed to install suspend handler");
        }
    });
}

/// Address near the current top of stack.
#[inline(never)]
pub fn approximate_sp() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker as *const u8 as usize)
}

/// Bounds of the current thread's stack: the highest scannable address.
fn current_stack_top() -> usize {
    #[cfg(target_os = "linux")]
    fn imp() -> usize {
        // safety: straight pthread attr queries on the current thread
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                return approximate_sp();
            }
            let mut stack_addr: *mut libc::c_void = std::ptr::null_mut();
            let mut stack_size: libc::size_t = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 {
                return approximate_sp();
            }
            stack_addr as usize + stack_size
        }
    }
    #[cfg(target_os = "macos")]
    fn imp() -> usize {
        // safety: documented to return the stack's highest address
        unsafe { libc::pthread_get_stackaddr_np(libc::pthread_self()) as usize }
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn imp() -> usize {
        approximate_sp()
    }
    imp()
}

/// The current thread's scannable stack region, from (approximately) the
/// caller's frame to the top of the stack.
pub fn current_stack_region() -> Capability {
    let sp = approximate_sp();
    let top = current_stack_top().max(sp);
    Capability::from_raw_parts(sp, top - sp)
}

/// Registration handle; the thread stops being suspended (or scanned)
/// when this drops.
pub struct MutatorGuard {
    state: Arc<MutatorState>,
}

/// Register the current thread as a mutator: it will be suspended during
/// collections and its stack scanned for roots.
pub fn register_mutator() -> MutatorGuard {
    install_handler();
    let state = Arc::new(MutatorState {
        // safety: identifying the calling thread
        tid: unsafe { libc::pthread_self() },
        stack_top: current_stack_top(),
        saved_sp: AtomicUsize::new(0),
    });
    CURRENT.with(|c| c.set(Arc::as_ptr(&state)));
    loop {
        let mut mutators = MUTATORS.lock().unwrap();
        if !WORLD_STOPPED.load(Ordering::Acquire) {
            mutators.push(state.clone());
            break;
        }
        // a collection is in flight; wait for it rather than appearing
        // half-registered
        drop(mutators);
        std::thread::yield_now();
    }
    MutatorGuard { state }
}

/// Whether the current thread has registered as a mutator. The collector
/// only scans registered threads' stacks.
pub fn current_thread_registered() -> bool {
    CURRENT.with(|c| !c.get().is_null())
}

thread_local! {
    static AUTO_GUARD: std::cell::RefCell<Option<MutatorGuard>> =
        const { std::cell::RefCell::new(None) };
}

/// Register the current thread for the rest of its lifetime. Used by the
/// public entry points so callers of `gc_alloc` get their stacks scanned
/// without holding a guard themselves.
pub fn ensure_mutator_registered() {
    if current_thread_registered() {
        return;
    }
    AUTO_GUARD.with(|g| {
        let mut g = g.borrow_mut();
        if g.is_none() {
            *g = Some(register_mutator());
        }
    });
}

impl Drop for MutatorGuard {
    fn drop(&mut self) {
        loop {
            let mut mutators = MUTATORS.lock().unwrap();
            if WORLD_STOPPED.load(Ordering::Acquire) {
                drop(mutators);
                std::thread::yield_now();
                continue;
            }
            mutators.retain(|m| !Arc::ptr_eq(m, &self.state));
            break;
        }
        CURRENT.with(|c| c.set(std::ptr::null()));
    }
}

/// Suspend every registered mutator except the calling thread. Returns
/// once all of them have checked in.
pub fn stop_the_world() {
    install_handler();
    // only one collector may own a stop..start window at a time
    while STW_OWNER.swap(true, Ordering::Acquire) {
        std::hint::spin_loop();
    }
    WORLD_STOPPED.store(true, Ordering::SeqCst);
    let mutators = MUTATORS.lock().unwrap();
    // safety: pthread_self is the calling thread
    let me = unsafe { libc::pthread_self() };
    let mut expected = 0;
    for m in mutators.iter() {
        // safety: comparing and signalling live registered threads
        unsafe {
            if libc::pthread_equal(m.tid, me) == 0 {
                libc::pthread_kill(m.tid, SUSPEND_SIGNAL);
                expected += 1;
            }
        }
    }
    drop(mutators);
    while SUSPEND_ACKS.load(Ordering::Acquire) < expected {
        std::hint::spin_loop();
    }
}

/// Resume all suspended mutators and wait for them to leave their
/// checkpoints.
pub fn start_the_world() {
    WORLD_STOPPED.store(false, Ordering::SeqCst);
    while SUSPEND_ACKS.load(Ordering::Acquire) > 0 {
        std::hint::spin_loop();
    }
    STW_OWNER.store(false, Ordering::Release);
}

/// Visit the stack region of every suspended mutator other than the
/// caller, from each thread's saved stack pointer to its stack top. Only
/// meaningful between [`stop_the_world`] and [`start_the_world`].
///
/// Callback-based so the caller allocates nothing while the world is
/// stopped (a suspended thread may hold the global allocator's lock).
pub fn for_each_stopped_stack(mut f: impl FnMut(Capability)) {
    let mutators = MUTATORS.lock().unwrap();
    // safety: identifying the calling thread
    let me = unsafe { libc::pthread_self() };
    for m in mutators.iter() {
        // safety: comparing thread ids
        if unsafe { libc::pthread_equal(m.tid, me) } != 0 {
            continue;
        }
        // order: pairs with the release in the suspend handler
        let sp = m.saved_sp.load(Ordering::Acquire);
        if sp != 0 && m.stack_top > sp {
            f(Capability::from_raw_parts(sp, m.stack_top - sp));
        }
    }
}

/// Run `f` with the caller's callee-saved registers written into a stack
/// buffer, so a conservative stack scan performed inside `f` observes
/// every register-resident pointer. (Caller-saved registers are already
/// spilled by the act of making these calls.)
#[inline(never)]
pub fn with_spilled_registers<R>(f: impl FnOnce() -> R) -> R {
    let mut regs = [0usize; 12];
    #[cfg(target_arch = "x86_64")]
    // safety: stores registers into an in-bounds stack buffer
    unsafe {
        std::arch::asm!(
            "mov [{b}], rbx",
            "mov [{b} + 8], rbp",
            "mov [{b} + 16], r12",
            "mov [{b} + 24], r13",
            "mov [{b} + 32], r14",
            "mov [{b} + 40], r15",
            b = in(reg) regs.as_mut_ptr(),
            options(nostack),
        );
    }
    #[cfg(target_arch = "aarch64")]
    // safety: stores registers into an in-bounds stack buffer
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{b}]",
            "stp x21, x22, [{b}, #16]",
            "stp x23, x24, [{b}, #32]",
            "stp x25, x26, [{b}, #48]",
            "stp x27, x28, [{b}, #64]",
            "str x29, [{b}, #80]",
            b = in(reg) regs.as_mut_ptr(),
            options(nostack),
        );
    }
    let result = f();
    // keep the spill buffer live (and on this frame) until f returns
    std::hint::black_box(&regs);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn stack_region_covers_locals() {
        let local = 42u64;
        let region = current_stack_region();
        assert!(region.contains_addr(&local as *const u64 as usize));
    }

    #[test]
    fn spilled_registers_run_closure() {
        let x = with_spilled_registers(|| 7 * 6);
        assert_eq!(x, 42);
    }

    #[test]
    fn stop_start_pauses_registered_thread() {
        static TICKS: AtomicU64 = AtomicU64::new(0);
        static DONE: AtomicBool = AtomicBool::new(false);

        let t = std::thread::spawn(|| {
            let _guard = register_mutator();
            while !DONE.load(Ordering::Relaxed) {
                TICKS.fetch_add(1, Ordering::Relaxed);
            }
        });
        // let the thread spin up
        while TICKS.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }

        stop_the_world();
        let mut stacks = 0;
        for_each_stopped_stack(|_| stacks += 1);
        assert_eq!(stacks, 1);
        let a = TICKS.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(50));
        let b = TICKS.load(Ordering::Relaxed);
        assert_eq!(a, b, "registered thread kept running while stopped");
        start_the_world();

        std::thread::sleep(Duration::from_millis(10));
        assert!(TICKS.load(Ordering::Relaxed) > b, "thread did not resume");
        DONE.store(true, Ordering::Relaxed);
        t.join().unwrap();
    }
}
