//! Simulation environment for running `tick_kernel` on a hosted environment.
//!
//! Tasks are cooperative. Each task is a closure that the dispatcher calls
//! every time the task is chosen to run, and the task runs until the closure
//! returns. A closure that starts a blocking operation and gets
//! [`Poll::Pending`] simply returns [`Step::Continue`]; the dispatcher won't
//! choose the task again until the kernel makes it ready, at which point the
//! closure collects the outcome with [`Kernel::take_wait_result`].
//!
//! The tick source is either the application calling [`System::tick`] or a
//! background thread started by [`System::start_tick_thread`].
//!
//! [`Poll::Pending`]: core::task::Poll::Pending
#![deny(unsafe_code)]
use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};
use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};
use tick_kernel::{CreateTaskError, Kernel, KernelConfig, Port, Priority, TaskId};

/// Used by applications that don't want to name `tick_kernel` separately
pub extern crate tick_kernel;
#[doc(hidden)]
pub extern crate env_logger;

/// Initialize `env_logger`. Does nothing if a logger is already installed.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(cfg!(test)).try_init();
}

/// The kernel type driven by [`System`].
pub type StdKernel<const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize> =
    Kernel<StdPort, TASKS, TIMERS, EVENTS, HEAP_WORDS>;

/// What a task body wants the dispatcher to do after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Call the body again. If the task is now waiting, this happens after
    /// the kernel wakes it up.
    Continue,
    /// The task has completed. Its control block is released.
    Exit,
}

/// A task body. Receives the locked kernel and the task's own identifier.
pub type TaskBody<K> = Box<dyn FnMut(&mut K, TaskId) -> Step + Send>;

#[derive(Debug, Clone, Copy)]
struct ReadyEntry {
    priority: Priority,
    /// Breaks ties between tasks of the same priority.
    seq: u64,
    task: TaskId,
}

/// The scheduler half of the simulated system: a priority-ordered ready
/// queue and the identity of the running task.
#[derive(Debug, Default)]
pub struct StdPort {
    ready: Vec<ReadyEntry>,
    running: Option<TaskId>,
    priorities: Vec<(TaskId, Priority)>,
    next_seq: u64,
    cpu_lock: bool,
}

impl StdPort {
    /// Record the priority used to order `task` in the ready queue.
    pub fn register(&mut self, task: TaskId, priority: Priority) {
        self.unregister(task);
        self.priorities.push((task, priority));
    }

    /// Forget a task. Removes it from the ready queue if it's there.
    pub fn unregister(&mut self, task: TaskId) {
        self.priorities.retain(|&(t, _)| t != task);
        self.ready.retain(|e| e.task != task);
    }

    fn priority_of(&self, task: TaskId) -> Priority {
        self.priorities
            .iter()
            .find(|&&(t, _)| t == task)
            .map_or(Priority::MAX, |&(_, p)| p)
    }

    /// Remove and return the highest-priority ready task. Tasks of the same
    /// priority come out in the order they became ready.
    pub fn pop_ready(&mut self) -> Option<TaskId> {
        let i = self
            .ready
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.priority, e.seq))
            .map(|(i, _)| i)?;
        Some(self.ready.remove(i).task)
    }

    /// Get the number of tasks in the ready queue.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn set_running(&mut self, task: Option<TaskId>) {
        self.running = task;
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock
    }
}

impl Port for StdPort {
    fn make_ready(&mut self, task: TaskId) {
        log::trace!("make_ready({:?})", task);
        debug_assert!(
            self.ready.iter().all(|e| e.task != task),
            "{:?} is already in the ready queue",
            task
        );
        let entry = ReadyEntry {
            priority: self.priority_of(task),
            seq: self.next_seq,
            task,
        };
        self.next_seq += 1;
        self.ready.push(entry);
    }

    fn running_task(&self) -> Option<TaskId> {
        self.running
    }

    fn enter_cpu_lock(&mut self) {
        debug_assert!(!self.cpu_lock);
        self.cpu_lock = true;
    }

    fn leave_cpu_lock(&mut self) {
        debug_assert!(self.cpu_lock);
        self.cpu_lock = false;
    }

    fn set_priority(&mut self, task: TaskId, priority: Priority) {
        log::trace!("set_priority({:?}, {})", task, priority);
        if let Some(entry) = self.priorities.iter_mut().find(|(t, _)| *t == task) {
            entry.1 = priority;
        }
        if let Some(entry) = self.ready.iter_mut().find(|e| e.task == task) {
            entry.priority = priority;
        }
    }
}

/// A simulated system: a kernel shared with the tick thread, plus the task
/// bodies.
pub struct System<const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
{
    kernel: Arc<SpinMutex<StdKernel<TASKS, TIMERS, EVENTS, HEAP_WORDS>>>,
    bodies: Vec<Option<TaskBody<StdKernel<TASKS, TIMERS, EVENTS, HEAP_WORDS>>>>,
}

impl<const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize> Default
    for System<TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    System<TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Self {
            kernel: Arc::new(SpinMutex::new(Kernel::with_config(
                StdPort::default(),
                config,
            ))),
            bodies: (0..TASKS).map(|_| None).collect(),
        }
    }

    /// Lock the kernel.
    ///
    /// Don't hold the guard across [`Self::run_once`]; the dispatcher locks
    /// the kernel itself.
    pub fn kernel(&self) -> SpinMutexGuard<'_, StdKernel<TASKS, TIMERS, EVENTS, HEAP_WORDS>> {
        self.kernel.lock()
    }

    /// Create a task and put it in the ready queue.
    pub fn spawn(
        &mut self,
        priority: Priority,
        body: impl FnMut(&mut StdKernel<TASKS, TIMERS, EVENTS, HEAP_WORDS>, TaskId) -> Step
            + Send
            + 'static,
    ) -> Result<TaskId, CreateTaskError> {
        let mut k = self.kernel.lock();
        let task = k.create_task(priority)?;
        k.port_mut().register(task, priority);
        k.port_mut().make_ready(task);
        drop(k);

        log::debug!("spawned {:?} with priority {}", task, priority);
        self.bodies[task.index()] = Some(Box::new(body));
        Ok(task)
    }

    /// Run the highest-priority ready task once. Returns `None` if no task
    /// is ready.
    pub fn run_once(&mut self) -> Option<TaskId> {
        let mut k = self.kernel.lock();
        let task = k.port_mut().pop_ready()?;
        let Some(body) = self.bodies[task.index()].as_mut() else {
            log::warn!("{:?} is ready but has no body", task);
            return Some(task);
        };

        k.port_mut().set_running(Some(task));
        let step = body(&mut *k, task);
        k.port_mut().set_running(None);

        match step {
            Step::Exit => {
                log::debug!("{:?} exited", task);
                self.bodies[task.index()] = None;
                k.port_mut().unregister(task);
                if let Err(e) = k.delete_task(task) {
                    log::warn!("couldn't delete {:?}: {:?}", task, e);
                }
            }
            Step::Continue if k.is_task_waiting(task) => {}
            Step::Continue => k.port_mut().make_ready(task),
        }
        Some(task)
    }

    /// Run tasks until the ready queue is empty. Returns the number of task
    /// activations.
    pub fn run_until_idle(&mut self) -> usize {
        let mut count = 0;
        while self.run_once().is_some() {
            count += 1;
        }
        count
    }

    /// Advance the system time by `ticks` ticks.
    pub fn tick(&self, ticks: u32) {
        let mut k = self.kernel.lock();
        for _ in 0..ticks {
            k.advance_one_tick();
        }
    }

    /// Start a thread that calls [`Kernel::advance_one_tick`] every `period`.
    ///
    /// The thread stops when the returned handle is dropped.
    pub fn start_tick_thread(&self, period: Duration) -> TickThread {
        let kernel = Arc::clone(&self.kernel);
        let (stop_send, stop_recv) = mpsc::channel::<()>();

        log::trace!("starting the tick thread");
        let join_handle = thread::spawn(move || {
            let mut next_deadline = Instant::now() + period;
            loop {
                let timeout = next_deadline.saturating_duration_since(Instant::now());
                match stop_recv.recv_timeout(timeout) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        kernel.lock().advance_one_tick();
                        next_deadline += period;
                    }
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        TickThread {
            stop_send: Some(stop_send),
            join_handle: Some(join_handle),
        }
    }
}

/// A handle to the thread started by [`System::start_tick_thread`].
#[derive(Debug)]
pub struct TickThread {
    stop_send: Option<mpsc::Sender<()>>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl Drop for TickThread {
    fn drop(&mut self) {
        // `recv_timeout` returns `Disconnected` once the sender is gone
        self.stop_send = None;
        if let Some(join_handle) = self.join_handle.take() {
            log::trace!("stopping the tick thread");
            if let Err(e) = join_handle.join() {
                std::panic::resume_unwind(e);
            }
        }
    }
}
