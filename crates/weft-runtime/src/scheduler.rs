//! N:M coroutine scheduler
//!
//! A scheduler owns one FIFO task queue drained by a pool of worker
//! threads, plus optionally the thread that called `start`. Tasks are
//! either ready coroutines or plain callbacks; a callback is wrapped into a
//! coroutine only when a worker dequeues it. Each task may be pinned to one
//! kernel thread id, and a worker never runs a task pinned elsewhere.
//!
//! The reactor seam: anything that drives workers implements [`Reactor`],
//! which supplies the shared [`SchedCore`], a wakeup primitive and an idle
//! step. The base [`Scheduler`] parks idle workers on a semaphore; the IO
//! manager parks them in `epoll_wait` instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use weft_core::{kdebug, kinfo, kwarn};

use crate::coroutine::Coroutine;
use crate::iomanager::IoManager;
use crate::parking::Semaphore;
use crate::tls;

/// What a dequeued task turns into.
pub enum TaskUnit {
    /// A coroutine ready to be resumed.
    Co(Arc<Coroutine>),
    /// A callback, wrapped into a fresh coroutine at dequeue time.
    Call(Box<dyn FnOnce() + Send + 'static>),
}

/// A queued unit of work, optionally pinned to one kernel thread.
pub struct Task {
    pub(crate) unit: TaskUnit,
    /// Kernel thread id this task must run on; 0 means any worker.
    pub(crate) tid: libc::pid_t,
}

impl Task {
    pub fn call(f: impl FnOnce() + Send + 'static, tid: libc::pid_t) -> Self {
        Self {
            unit: TaskUnit::Call(Box::new(f)),
            tid,
        }
    }

    pub fn co(co: Arc<Coroutine>, tid: libc::pid_t) -> Self {
        Self {
            unit: TaskUnit::Co(co),
            tid,
        }
    }
}

/// Anything that accepts work.
pub trait Schedule: Send + Sync {
    /// Queue a task. Returns false once the scheduler is stopping.
    fn submit(&self, task: Task) -> bool;
}

/// Convenience constructors over [`Schedule`].
pub trait ScheduleExt: Schedule {
    fn schedule(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.submit(Task::call(f, 0))
    }

    fn schedule_at(&self, f: impl FnOnce() + Send + 'static, tid: libc::pid_t) -> bool {
        self.submit(Task::call(f, tid))
    }

    fn schedule_co(&self, co: Arc<Coroutine>, tid: libc::pid_t) -> bool {
        self.submit(Task::co(co, tid))
    }
}

impl<T: Schedule + ?Sized> ScheduleExt for T {}

/// State shared by every worker of one scheduler.
pub struct SchedCore {
    name: String,
    use_caller: bool,
    caller_tid: libc::pid_t,
    /// Background workers configured at construction.
    worker_count: usize,
    /// Background workers that have not exited their run loop yet.
    alive: AtomicUsize,
    stopping: AtomicBool,
    stopped: AtomicBool,
    idle_cnt: AtomicUsize,
    tasks: Mutex<VecDeque<Task>>,
    sema: Semaphore,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedCore {
    pub(crate) fn new(name: &str, use_caller: bool, worker_count: usize) -> Self {
        Self {
            name: name.to_string(),
            use_caller,
            caller_tid: tls::current_tid(),
            worker_count,
            alive: AtomicUsize::new(worker_count),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            idle_cnt: AtomicUsize::new(0),
            tasks: Mutex::new(VecDeque::new()),
            sema: Semaphore::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Queued tasks, pinned or not.
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub(crate) fn has_idle(&self) -> bool {
        self.idle_cnt.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn alive_workers(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn is_caller_thread(&self) -> bool {
        self.use_caller && tls::current_tid() == self.caller_tid
    }

    /// Returns None when stopping, otherwise whether the queue went
    /// non-empty (the submitter then tickles a worker).
    pub(crate) fn push(&self, task: Task) -> Option<bool> {
        if self.is_stopping() {
            return None;
        }
        let mut q = self.tasks.lock().unwrap();
        let was_empty = q.is_empty();
        q.push_back(task);
        Some(was_empty)
    }

    pub(crate) fn push_batch(&self, tasks: Vec<Task>) -> Option<bool> {
        if tasks.is_empty() {
            return Some(false);
        }
        if self.is_stopping() {
            return None;
        }
        let mut q = self.tasks.lock().unwrap();
        let was_empty = q.is_empty();
        q.extend(tasks);
        Some(was_empty)
    }

    /// Park on the semaphore with the idle count held up around the wait.
    pub(crate) fn idle_wait(&self) {
        self.idle_cnt.fetch_add(1, Ordering::SeqCst);
        self.sema.wait();
        self.idle_cnt.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn idle_enter(&self) {
        self.idle_cnt.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn idle_exit(&self) {
        self.idle_cnt.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn post(&self) {
        self.sema.post();
    }
}

/// A worker-driving scheduler backend.
///
/// `idle_cycle` performs one blocking wait (semaphore, epoll, ...) and
/// returns false when the idle coroutine should finish; the generic idle
/// loop yields back to the run loop between cycles.
pub trait Reactor: Schedule + Sized + Send + Sync + 'static {
    fn core(&self) -> &SchedCore;

    /// Wake one parked worker.
    fn tickle(&self);

    /// One idle step; false ends this worker's idle coroutine.
    fn idle_cycle(&self) -> bool;

    /// Whether workers of this reactor intercept blocking calls.
    fn use_hook(&self) -> bool {
        false
    }

    /// The IO manager behind this reactor, if it is one.
    fn as_io_manager(self: &Arc<Self>) -> Option<Arc<IoManager>> {
        None
    }
}

/// The run loop every worker thread executes.
fn run_worker<R: Reactor>(r: Arc<R>, is_caller: bool) {
    let my_tid = tls::current_tid();
    kinfo!("{} worker {} running", r.core().name(), my_tid);
    if r.use_hook() {
        tls::enable_hook(true);
    }
    tls::set_scheduler(r.clone() as Arc<dyn Schedule>, r.as_io_manager());

    // The idle coroutine holds the reactor weakly so a suspended idle frame
    // never keeps the reactor alive after shutdown.
    let weak = Arc::downgrade(&r);
    let idle_co = Coroutine::new(move || loop {
        let Some(r) = weak.upgrade() else { break };
        let keep = r.idle_cycle();
        drop(r);
        if !keep {
            break;
        }
        Coroutine::yield_current();
    });

    loop {
        let mut picked: Option<Task> = None;
        let mut need_tickle = false;
        {
            let core = r.core();
            let mut q = core.tasks.lock().unwrap();
            for i in 0..q.len() {
                if q[i].tid != 0 && q[i].tid != my_tid {
                    continue;
                }
                picked = q.remove(i);
                break;
            }
            if picked.is_some() && !q.is_empty() && core.has_idle() {
                need_tickle = true;
            }
        }
        if need_tickle {
            r.tickle();
        }

        match picked {
            Some(task) => {
                let co = match task.unit {
                    TaskUnit::Co(co) => co,
                    TaskUnit::Call(f) => Coroutine::new(f),
                };
                if co.state().can_resume() {
                    co.resume();
                } else {
                    kwarn!(
                        "{} dropping task for coroutine {} in state {}",
                        r.core().name(),
                        co.id(),
                        co.state()
                    );
                }
            }
            None => {
                let core = r.core();
                if core.is_stopping() {
                    // The caller thread lingers until every background
                    // worker has exited, so late wakeups still land.
                    if is_caller && core.alive_workers() != 0 {
                        idle_co.resume();
                        continue;
                    }
                    break;
                }
                idle_co.resume();
            }
        }
    }

    if !is_caller {
        r.core().alive.fetch_sub(1, Ordering::SeqCst);
    }
    r.tickle();
    tls::clear_scheduler();
    if r.use_hook() {
        tls::enable_hook(false);
    }
    kinfo!("{} worker {} exited", r.core().name(), my_tid);
}

/// Spawn the background workers and, with `use_caller`, run the calling
/// thread's loop until stop completes.
pub(crate) fn start_reactor<R: Reactor>(r: &Arc<R>) {
    let core = r.core();
    {
        let mut threads = core.threads.lock().unwrap();
        if !core.stopped.swap(false, Ordering::SeqCst) {
            kwarn!("{} already started", core.name());
            return;
        }
        for i in 0..core.worker_count {
            let rc = r.clone();
            let name = format!("{}-{}", core.name(), i + 1);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || run_worker(rc, false))
                .expect("spawn worker thread");
            threads.push(handle);
        }
    }
    if core.use_caller {
        assert_eq!(
            tls::current_tid(),
            core.caller_tid,
            "{}: start must run on the thread that built the scheduler",
            core.name()
        );
        run_worker(r.clone(), true);
    }
}

/// Ask every worker to finish once the queue drains. Asynchronous; pair
/// with a join to wait for the background threads.
pub(crate) fn stop_reactor<R: Reactor>(r: &Arc<R>) {
    let core = r.core();
    if core.is_stopped() {
        return;
    }
    if core.stopping.swap(true, Ordering::SeqCst) {
        return;
    }
    kdebug!("{} stopping", core.name());
    for _ in 0..=core.worker_count {
        r.tickle();
    }
}

pub(crate) fn join_reactor<R: Reactor>(r: &Arc<R>) {
    let handles: Vec<_> = {
        let mut threads = r.core().threads.lock().unwrap();
        threads.drain(..).collect()
    };
    for h in handles {
        let _ = h.join();
    }
    r.core().stopped.store(true, Ordering::SeqCst);
}

/// The semaphore-parked scheduler.
pub struct Scheduler {
    core: SchedCore,
}

impl Scheduler {
    /// `threads` counts the caller when `use_caller` is set, so
    /// `new("s", true, 1)` runs everything on the calling thread.
    pub fn new(name: &str, use_caller: bool, threads: usize) -> Arc<Self> {
        assert!(threads >= 1, "scheduler needs at least one thread");
        let workers = if use_caller { threads - 1 } else { threads };
        Arc::new(Self {
            core: SchedCore::new(name, use_caller, workers),
        })
    }

    pub fn start(self: &Arc<Self>) {
        start_reactor(self);
    }

    pub fn stop(self: &Arc<Self>) {
        stop_reactor(self);
    }

    /// Wait for background workers to exit; call after `stop`.
    pub fn join(self: &Arc<Self>) {
        join_reactor(self);
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn is_stopping(&self) -> bool {
        self.core.is_stopping()
    }

    pub fn pending(&self) -> usize {
        self.core.pending()
    }
}

impl Schedule for Scheduler {
    fn submit(&self, task: Task) -> bool {
        match self.core.push(task) {
            None => false,
            Some(need_tickle) => {
                if need_tickle {
                    Reactor::tickle(self);
                }
                true
            }
        }
    }
}

impl Reactor for Scheduler {
    fn core(&self) -> &SchedCore {
        &self.core
    }

    // Unconditional: a permit posted while no worker is parked is consumed
    // by the next idle_wait, which closes the park/post race.
    fn tickle(&self) {
        self.core.post();
    }

    fn idle_cycle(&self) -> bool {
        if self.core.is_stopping() {
            if self.core.is_caller_thread() && self.core.alive_workers() != 0 {
                self.core.idle_wait();
                return true;
            }
            return false;
        }
        self.core.idle_wait();
        true
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use weft_core::state::CoState;

    #[test]
    fn test_caller_thread_runs_fifo() {
        let sched = Scheduler::new("fifo", true, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let o = order.clone();
            assert!(sched.schedule(move || o.lock().unwrap().push(i)));
        }
        let s = sched.clone();
        sched.schedule(move || s.stop());
        sched.start();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_pinned_task_not_stolen() {
        let sched = Scheduler::new("pin", true, 1);
        let me = tls::current_tid();
        let mine = Arc::new(AtomicUsize::new(0));
        let foreign = Arc::new(AtomicUsize::new(0));

        let m = mine.clone();
        sched.schedule_at(move || { m.fetch_add(1, Ordering::SeqCst); }, me);
        let f = foreign.clone();
        sched.schedule_at(move || { f.fetch_add(1, Ordering::SeqCst); }, me + 100_000);
        let s = sched.clone();
        sched.schedule(move || s.stop());
        sched.start();

        assert_eq!(mine.load(Ordering::SeqCst), 1);
        assert_eq!(foreign.load(Ordering::SeqCst), 0);
        // The foreign-pinned task is still queued, never stolen.
        assert_eq!(sched.pending(), 1);
    }

    #[test]
    fn test_background_workers_drain_queue() {
        let sched = Scheduler::new("bg", false, 2);
        sched.start();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let d = done.clone();
            assert!(sched.schedule(move || { d.fetch_add(1, Ordering::SeqCst); }));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while done.load(Ordering::SeqCst) < 20 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 20);
        sched.stop();
        sched.join();
        assert!(sched.core.is_stopped());
    }

    #[test]
    fn test_submit_rejected_while_stopping() {
        let sched = Scheduler::new("rej", false, 1);
        sched.start();
        sched.stop();
        assert!(!sched.schedule(|| {}));
        sched.join();
    }

    #[test]
    fn test_yielding_coroutine_completes_before_stop_finishes() {
        let sched = Scheduler::new("e2e", true, 1);
        let finished = Arc::new(AtomicUsize::new(0));
        let s = sched.clone();
        let f = finished.clone();
        let co = Coroutine::new(move || {
            let me = tls::running().unwrap();
            s.schedule_co(me, 0);
            Coroutine::yield_current();
            f.fetch_add(1, Ordering::SeqCst);
        });
        sched.schedule_co(co.clone(), 0);
        let s = sched.clone();
        sched.schedule(move || s.stop());
        sched.start();

        // The requeued slice ran even though stop came in between.
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(co.state(), CoState::Terminal);
        assert_eq!(sched.pending(), 0);
    }
}
