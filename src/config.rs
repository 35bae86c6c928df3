//! Kernel configuration.
//!
//! Board code builds a [`KernelConfig`] once and hands it to
//! [`Kernel::new`](crate::Kernel::new). All limits are checked there, not on
//! the hot paths.

use crate::errors::{FatalError, KernelError, KernelResult};
use crate::sched::ready::MAX_PRIORITY_LEVELS;
use crate::task::TaskId;
use crate::time::{Tick, DEFAULT_TICK_PER_SECOND};

/// Called with the fatal condition before the kernel halts.
pub type SafetyHook = fn(&FatalError);

/// Called on every context switch with the outgoing and incoming task.
pub type SwitchHook = fn(TaskId, TaskId);

/// Settings for the kernel-owned system workqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemWorkqueueConfig {
    pub priority: u8,
    pub stack_size: usize,
}

/// Kernel build-time and boot-time settings.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Number of priority levels, 1..=256. Priority 0 is the highest; the
    /// lowest level is reserved for the idle task.
    pub priority_levels: u16,
    /// Tick frequency in Hz
    pub tick_per_second: u32,
    /// Default round-robin slice, in ticks
    pub time_slice: Tick,
    /// Longest task or object name kept, in bytes
    pub name_max: usize,
    pub idle_stack_size: usize,
    /// Upper bound on live tasks
    pub max_tasks: usize,
    /// Upper bound on live objects of each IPC kind
    pub max_objects: usize,
    /// Check the outgoing task's stack on every switch
    pub stack_check: bool,
    pub safety_hook: Option<SafetyHook>,
    pub switch_hook: Option<SwitchHook>,
    pub system_workqueue: Option<SystemWorkqueueConfig>,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            priority_levels: 32,
            tick_per_second: DEFAULT_TICK_PER_SECOND,
            time_slice: 10,
            name_max: 15,
            idle_stack_size: 512,
            max_tasks: 64,
            max_objects: 128,
            stack_check: true,
            safety_hook: None,
            switch_hook: None,
            system_workqueue: None,
        }
    }

    pub const fn with_priority_levels(mut self, levels: u16) -> Self {
        self.priority_levels = levels;
        self
    }

    pub const fn with_tick_per_second(mut self, hz: u32) -> Self {
        self.tick_per_second = hz;
        self
    }

    pub const fn with_time_slice(mut self, ticks: Tick) -> Self {
        self.time_slice = ticks;
        self
    }

    pub const fn with_idle_stack_size(mut self, size: usize) -> Self {
        self.idle_stack_size = size;
        self
    }

    pub const fn with_max_tasks(mut self, max: usize) -> Self {
        self.max_tasks = max;
        self
    }

    pub const fn with_stack_check(mut self, enabled: bool) -> Self {
        self.stack_check = enabled;
        self
    }

    pub const fn with_safety_hook(mut self, hook: SafetyHook) -> Self {
        self.safety_hook = Some(hook);
        self
    }

    pub const fn with_switch_hook(mut self, hook: SwitchHook) -> Self {
        self.switch_hook = Some(hook);
        self
    }

    pub const fn with_system_workqueue(mut self, priority: u8, stack_size: usize) -> Self {
        self.system_workqueue = Some(SystemWorkqueueConfig {
            priority,
            stack_size,
        });
        self
    }

    /// Priority of the idle task: the lowest level.
    pub fn idle_priority(&self) -> u8 {
        (self.priority_levels - 1) as u8
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> KernelResult<()> {
        if self.priority_levels < 2 || self.priority_levels as usize > MAX_PRIORITY_LEVELS {
            return Err(KernelError::InvalidArgument);
        }
        if self.tick_per_second == 0 || self.time_slice == 0 || self.max_tasks == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(wq) = self.system_workqueue {
            if wq.priority as u16 >= self.priority_levels {
                return Err(KernelError::InvalidArgument);
            }
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
