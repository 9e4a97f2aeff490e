//! Test harness shared by the unit tests
use crate::{Kernel, Port, Priority, TaskId, TimerId};

/// A port that records the tasks made ready instead of scheduling them.
#[derive(Debug, Default)]
pub struct MockPort {
    pub running: Option<TaskId>,
    pub ready: Vec<TaskId>,
    pub cpu_lock_active: bool,
    pub cpu_lock_entries: usize,
    /// Timer expirations recorded by test callbacks: `(tick, timer)`.
    pub fired: Vec<(u64, TimerId)>,
    /// Priority changes reported by the kernel.
    pub priorities: Vec<(TaskId, Priority)>,
}

impl Port for MockPort {
    fn make_ready(&mut self, task: TaskId) {
        log::trace!("make_ready({:?})", task);
        assert!(!self.ready.contains(&task), "{:?} was made ready twice", task);
        self.ready.push(task);
    }

    fn running_task(&self) -> Option<TaskId> {
        self.running
    }

    fn enter_cpu_lock(&mut self) {
        assert!(!self.cpu_lock_active);
        self.cpu_lock_active = true;
        self.cpu_lock_entries += 1;
    }

    fn leave_cpu_lock(&mut self) {
        assert!(self.cpu_lock_active);
        self.cpu_lock_active = false;
    }

    fn set_priority(&mut self, task: TaskId, priority: Priority) {
        log::trace!("set_priority({:?}, {})", task, priority);
        self.priorities.push((task, priority));
    }
}

pub type TestKernel = Kernel<MockPort, 8, 8, 8, 256>;

pub fn new_kernel() -> TestKernel {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::new(MockPort::default())
}

impl TestKernel {
    /// Pretend `task` is running.
    pub fn run(&mut self, task: TaskId) -> &mut Self {
        self.port_mut().running = Some(task);
        self
    }

    /// Take the tasks made ready since the last call.
    pub fn drain_ready(&mut self) -> Vec<TaskId> {
        core::mem::take(&mut self.port_mut().ready)
    }

    pub fn advance(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.advance_one_tick();
        }
    }
}
