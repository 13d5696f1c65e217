//! Cooperative thread manager: slot-table threads, conditions, recursive
//! locks, and a FIFO scheduler on a single hart.
//!
//! Preemption only happens through interrupt handlers marking threads
//! ready; an actual context switch always occurs at an explicit suspension
//! point. The idle thread keeps the ready list nonempty forever.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::{self, Context};
use crate::klib::error::{KernelError, Result};
use crate::sync::IrqMutex;

pub type Tid = usize;

pub const MAX_THREADS: usize = 32;
pub const MAIN_TID: Tid = 0;
pub const IDLE_TID: Tid = 1;

const STACK_SIZE: usize = 32 * 1024;
pub const MAX_ARGS: usize = 8;

/// Thread entry point; receives the (up to eight) spawn arguments.
pub type ThreadEntry = fn(&[u64; MAX_ARGS]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Waiting,
    Exited,
}

struct Thread {
    name: String,
    state: ThreadState,
    context: Context,
    stack: Option<Vec<u8>>,
    parent: Option<Tid>,
    #[cfg_attr(not(target_arch = "riscv64"), allow(dead_code))]
    entry: Option<ThreadEntry>,
    #[cfg_attr(not(target_arch = "riscv64"), allow(dead_code))]
    args: [u64; MAX_ARGS],
    /// Signaled whenever one of this thread's children exits.
    child_exit: Arc<Condition>,
    /// Locks currently held; force-released on exit.
    held: Vec<Lock>,
}

impl Thread {
    fn new(name: &str, state: ThreadState, parent: Option<Tid>) -> Self {
        Self {
            name: String::from(name),
            state,
            context: Context::zero(),
            stack: None,
            parent,
            entry: None,
            args: [0; MAX_ARGS],
            child_exit: Arc::new(Condition::new("child-exit")),
            held: Vec::new(),
        }
    }
}

struct Scheduler {
    slots: Vec<Option<Box<Thread>>>,
    ready: VecDeque<Tid>,
    current: Tid,
    /// Thread we most recently switched away from; its stack is reaped on
    /// the other side of the swap if it exited.
    prev: Tid,
}

impl Scheduler {
    fn bootstrap() -> Self {
        let mut slots: Vec<Option<Box<Thread>>> = (0..MAX_THREADS).map(|_| None).collect();

        // The boot thread runs on the boot stack; it owns no heap stack.
        slots[MAIN_TID] = Some(Box::new(Thread::new("main", ThreadState::Running, None)));

        // The idle thread guarantees the ready list is never empty. It is
        // parentless so it never counts as anyone's joinable child.
        let mut idle = Thread::new("idle", ThreadState::Ready, None);
        let stack = vec![0u8; STACK_SIZE];
        idle.context = Context::with_entry(trampoline_addr(), stack_top(&stack));
        idle.stack = Some(stack);
        idle.entry = Some(idle_entry);
        slots[IDLE_TID] = Some(Box::new(idle));

        let mut ready = VecDeque::new();
        ready.push_back(IDLE_TID);

        Self {
            slots,
            ready,
            current: MAIN_TID,
            prev: MAIN_TID,
        }
    }

    fn thread(&self, tid: Tid) -> &Thread {
        self.slots[tid].as_ref().expect("dead thread slot")
    }

    fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.slots[tid].as_mut().expect("dead thread slot")
    }
}

lazy_static::lazy_static! {
    static ref SCHED: IrqMutex<Scheduler> = IrqMutex::new(Scheduler::bootstrap());
}

/// Bring up the slot table (main + idle records).
pub fn init() {
    lazy_static::initialize(&SCHED);
    crate::info!("thread: manager up, {} slots", MAX_THREADS);
}

pub fn current() -> Tid {
    SCHED.lock().current
}

pub fn current_name() -> String {
    let sched = SCHED.lock();
    let cur = sched.current;
    sched.thread(cur).name.clone()
}

fn stack_top(stack: &[u8]) -> usize {
    (stack.as_ptr() as usize + stack.len()) & !0xf
}

fn trampoline_addr() -> usize {
    #[cfg(target_arch = "riscv64")]
    {
        thread_trampoline as usize
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// First-entry path for spawned threads: reap the thread we switched away
/// from, run the entry function, then exit.
#[cfg(target_arch = "riscv64")]
extern "C" fn thread_trampoline() -> ! {
    reap_prev();
    let (entry, args) = {
        let mut sched = SCHED.lock();
        let cur = sched.current;
        let t = sched.thread_mut(cur);
        (t.entry.take().expect("thread started twice"), t.args)
    };
    entry(&args);
    exit();
}

/// Create a thread in state Ready at the tail of the ready list.
pub fn spawn(name: &str, entry: ThreadEntry, args: &[u64]) -> Result<Tid> {
    assert!(args.len() <= MAX_ARGS, "too many thread arguments");
    let mut argv = [0u64; MAX_ARGS];
    argv[..args.len()].copy_from_slice(args);

    let mut sched = SCHED.lock();
    let slot = sched
        .slots
        .iter()
        .position(|s| s.is_none())
        .ok_or(KernelError::OutOfThreads)?;

    let parent = sched.current;
    let mut thread = Thread::new(name, ThreadState::Ready, Some(parent));
    let stack = vec![0u8; STACK_SIZE];
    thread.context = Context::with_entry(trampoline_addr(), stack_top(&stack));
    thread.stack = Some(stack);
    thread.entry = Some(entry);
    thread.args = argv;

    sched.slots[slot] = Some(Box::new(thread));
    sched.ready.push_back(slot);
    Ok(slot)
}

/// Give up the hart, staying runnable.
pub fn yield_now() {
    schedule();
}

/// Terminate the calling thread. The main thread treats exit as a
/// successful halt of the whole system. Never returns.
pub fn exit() -> ! {
    let me = current();
    if me == MAIN_TID {
        crate::info!("main thread exited; halting");
        arch::halt();
    }

    // Force-release everything we hold so waiters can make progress.
    let held: Vec<Lock> = {
        let mut sched = SCHED.lock();
        sched.thread_mut(me).held.drain(..).collect()
    };
    for lock in held {
        lock.force_release();
    }

    let parent_cond = {
        let mut sched = SCHED.lock();
        sched.thread_mut(me).state = ThreadState::Exited;
        let parent = sched.thread(me).parent;
        parent.and_then(|p| sched.slots[p].as_ref().map(|t| t.child_exit.clone()))
    };
    if let Some(cond) = parent_cond {
        cond.broadcast();
    }

    schedule();
    unreachable!("exited thread rescheduled");
}

/// Wait for a child to exit and reclaim it. `tid == 0` means any child;
/// with no children at all that fails immediately.
pub fn join(tid: Tid) -> Result<Tid> {
    let me = current();
    let child_exit = { SCHED.lock().thread(me).child_exit.clone() };

    loop {
        {
            let mut sched = SCHED.lock();
            if tid != 0 {
                if tid >= MAX_THREADS || tid == IDLE_TID {
                    return Err(KernelError::InvalidArgument);
                }
                match sched.slots[tid].as_ref() {
                    None => return Err(KernelError::InvalidArgument),
                    Some(t) if t.parent != Some(me) => {
                        return Err(KernelError::InvalidArgument)
                    }
                    Some(t) if t.state == ThreadState::Exited => {
                        reclaim(&mut sched, tid, me);
                        return Ok(tid);
                    }
                    Some(_) => {}
                }
            } else {
                let mut exited = None;
                let mut has_child = false;
                for (slot, entry) in sched.slots.iter().enumerate() {
                    if let Some(t) = entry {
                        if t.parent == Some(me) {
                            has_child = true;
                            if t.state == ThreadState::Exited {
                                exited = Some(slot);
                                break;
                            }
                        }
                    }
                }
                if let Some(slot) = exited {
                    reclaim(&mut sched, slot, me);
                    return Ok(slot);
                }
                if !has_child {
                    return Err(KernelError::InvalidArgument);
                }
            }
        }
        child_exit.wait();
    }
}

/// Free the child's stack, splice its children up to us, null the slot.
fn reclaim(sched: &mut Scheduler, tid: Tid, parent: Tid) {
    for entry in sched.slots.iter_mut() {
        if let Some(t) = entry {
            if t.parent == Some(tid) {
                t.parent = Some(parent);
            }
        }
    }
    sched.slots[tid] = None;
}

fn idle_entry(_args: &[u64; MAX_ARGS]) {
    loop {
        let others_runnable = { !SCHED.lock().ready.is_empty() };
        if !others_runnable {
            arch::wait_for_interrupt();
        }
        yield_now();
    }
}

/// Suspend the running thread and switch to the ready-list head.
///
/// If the caller is still Running it stays runnable (appended to the ready
/// tail); a caller that already marked itself Waiting or Exited is left
/// alone. Interrupts are re-enabled just before the swap so device
/// completions keep landing while the next thread runs.
fn schedule() {
    #[cfg(not(target_arch = "riscv64"))]
    {
        panic!("context switch is only possible on the rv64 target");
    }

    #[cfg(target_arch = "riscv64")]
    {
        let was_enabled = arch::irq_save();
        let old_ctx: *mut Context;
        let new_ctx: *const Context;
        {
            let mut sched = SCHED.lock();
            let cur = sched.current;
            if sched.thread(cur).state == ThreadState::Running {
                sched.thread_mut(cur).state = ThreadState::Ready;
                sched.ready.push_back(cur);
            }

            let next = sched
                .ready
                .pop_front()
                .expect("ready list empty at suspend");
            // An interrupt may have readied us between our state flip and
            // this pop; resuming in place is then the correct resumption.
            if next == cur {
                sched.thread_mut(cur).state = ThreadState::Running;
                drop(sched);
                arch::irq_restore(was_enabled);
                return;
            }

            sched.thread_mut(next).state = ThreadState::Running;
            sched.prev = cur;
            sched.current = next;
            old_ctx = &mut sched.thread_mut(cur).context as *mut Context;
            new_ctx = &sched.thread(next).context as *const Context;
        }

        arch::irq_enable();
        unsafe {
            arch::switch_context(old_ctx, new_ctx);
        }
        // Back on this thread's stack: clean up after whoever ran last.
        reap_prev();
        arch::irq_restore(was_enabled);
    }
}

/// Free the stack of the thread we switched away from if it exited. Its
/// slot stays allocated until the parent joins it.
#[cfg_attr(not(target_arch = "riscv64"), allow(dead_code))]
fn reap_prev() {
    let mut sched = SCHED.lock();
    let prev = sched.prev;
    if let Some(t) = sched.slots[prev].as_mut() {
        if t.state == ThreadState::Exited {
            t.stack = None;
        }
    }
}

/// An ordered queue of threads that wake together on `broadcast`.
pub struct Condition {
    name: &'static str,
    waiters: IrqMutex<VecDeque<Tid>>,
}

impl Condition {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: IrqMutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block the calling thread until the next broadcast. The caller must
    /// re-check its predicate on return; wakeups are collective.
    pub fn wait(&self) {
        let was_enabled = arch::irq_save();
        {
            let mut waiters = self.waiters.lock();
            let mut sched = SCHED.lock();
            let cur = sched.current;
            sched.thread_mut(cur).state = ThreadState::Waiting;
            waiters.push_back(cur);
        }
        schedule();
        arch::irq_restore(was_enabled);
    }

    /// Wake every waiter, appending them to the ready tail in wait order.
    pub fn broadcast(&self) {
        let was_enabled = arch::irq_save();
        let woken = core::mem::take(&mut *self.waiters.lock());
        if !woken.is_empty() {
            let mut sched = SCHED.lock();
            for tid in woken {
                if let Some(t) = sched.slots[tid].as_mut() {
                    t.state = ThreadState::Ready;
                    sched.ready.push_back(tid);
                }
            }
        }
        arch::irq_restore(was_enabled);
    }
}

struct LockState {
    owner: Option<Tid>,
    count: u64,
}

struct LockInner {
    name: &'static str,
    state: IrqMutex<LockState>,
    released: Condition,
}

/// Recursive sleeping lock. Contended acquisition waits on the release
/// condition; the owner may re-acquire freely.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(LockInner {
                name,
                state: IrqMutex::new(LockState {
                    owner: None,
                    count: 0,
                }),
                released: Condition::new("lock-released"),
            }),
        }
    }

    pub fn acquire(&self) {
        let me = current();
        loop {
            {
                let mut state = self.inner.state.lock();
                match state.owner {
                    None => {
                        state.owner = Some(me);
                        state.count = 1;
                        drop(state);
                        self.note_held(me);
                        return;
                    }
                    Some(owner) if owner == me => {
                        state.count += 1;
                        return;
                    }
                    Some(_) => {}
                }
            }
            self.inner.released.wait();
        }
    }

    pub fn release(&self) {
        let me = current();
        let fully_released = {
            let mut state = self.inner.state.lock();
            assert_eq!(
                state.owner,
                Some(me),
                "lock '{}' released by non-owner",
                self.inner.name
            );
            assert!(state.count > 0, "lock '{}' over-released", self.inner.name);
            state.count -= 1;
            if state.count == 0 {
                state.owner = None;
                true
            } else {
                false
            }
        };
        if fully_released {
            self.forget_held(me);
            self.inner.released.broadcast();
        }
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.acquire();
        let result = f();
        self.release();
        result
    }

    pub fn is_held(&self) -> bool {
        self.inner.state.lock().owner.is_some()
    }

    /// Exit-path teardown: drop ownership regardless of count and wake
    /// every waiter.
    fn force_release(&self) {
        {
            let mut state = self.inner.state.lock();
            state.owner = None;
            state.count = 0;
        }
        self.inner.released.broadcast();
    }

    fn note_held(&self, me: Tid) {
        let mut sched = SCHED.lock();
        sched
            .slots[me]
            .as_mut()
            .expect("lock acquired by dead thread")
            .held
            .push(self.clone());
    }

    fn forget_held(&self, me: Tid) {
        let mut sched = SCHED.lock();
        if let Some(t) = sched.slots[me].as_mut() {
            t.held
                .retain(|l| !Arc::ptr_eq(&l.inner, &self.inner));
        }
    }
}

#[cfg(test)]
pub fn ready_order() -> Vec<Tid> {
    SCHED.lock().ready.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The slot table is process-global, so everything that consumes or
    // frees slots lives in this one test to keep it deterministic.
    #[test]
    fn spawn_join_and_exhaustion() {
        fn noop(_args: &[u64; MAX_ARGS]) {}

        let first = spawn("worker", noop, &[1, 2, 3]).unwrap();
        assert!(first != MAIN_TID && first != IDLE_TID);
        // FIFO: idle was queued at bootstrap, new spawns go to the tail.
        let order = ready_order();
        let idle_at = order.iter().position(|&t| t == IDLE_TID).unwrap();
        let first_at = order.iter().position(|&t| t == first).unwrap();
        assert!(idle_at < first_at);

        // Joining a thread that is not our child is invalid.
        assert_eq!(join(IDLE_TID), Err(KernelError::InvalidArgument));
        assert_eq!(join(MAX_THREADS + 5), Err(KernelError::InvalidArgument));

        // Fill the table; the next spawn must fail cleanly.
        let mut spawned = alloc::vec![first];
        loop {
            match spawn("filler", noop, &[]) {
                Ok(tid) => spawned.push(tid),
                Err(e) => {
                    assert_eq!(e, KernelError::OutOfThreads);
                    break;
                }
            }
        }
        assert_eq!(spawned.len(), MAX_THREADS - 2);
    }

    #[test]
    fn lock_acquire_release_balanced() {
        let lock = Lock::new("test");
        assert!(!lock.is_held());
        for _ in 0..5 {
            lock.acquire();
        }
        assert!(lock.is_held());
        for _ in 0..5 {
            lock.release();
        }
        assert!(!lock.is_held());
    }

    #[test]
    fn lock_with_runs_closure_under_lock() {
        let lock = Lock::new("with");
        let value = lock.with(|| {
            assert!(lock.is_held());
            7
        });
        assert_eq!(value, 7);
        assert!(!lock.is_held());
    }

    #[test]
    fn broadcast_with_no_waiters_is_noop() {
        let cond = Condition::new("empty");
        cond.broadcast();
        assert_eq!(cond.name(), "empty");
    }
}
