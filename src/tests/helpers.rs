//! Test helper utilities: booting a kernel on the simulation port and
//! recording what its tasks do.

use crate::arch::SimPort;
use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::task::{TaskBuilder, TaskId};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub(crate) type SimKernel = Kernel<SimPort>;

/// Stack size for test tasks.
pub(crate) const STACK: usize = 2048;

/// How long the host waits for a scenario before giving up.
const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Create a kernel that lives for the rest of the test process.
pub(crate) fn kernel(config: KernelConfig) -> &'static SimKernel {
    Box::leak(Box::new(Kernel::new(config).expect("valid config")))
}

/// Create and start a task.
pub(crate) fn spawn<F>(kernel: &'static SimKernel, name: &str, priority: u8, entry: F) -> TaskId
where
    F: FnOnce() + Send + 'static,
{
    TaskBuilder::new(name)
        .priority(priority)
        .stack_size(STACK)
        .spawn(kernel, entry)
        .expect("spawn task")
}

/// Start scheduling on a dedicated host thread. The thread hands the CPU
/// token to the first task and never comes back.
pub(crate) fn boot(kernel: &'static SimKernel) {
    std::thread::Builder::new()
        .name(String::from("sim-boot"))
        .spawn(move || {
            kernel.start();
        })
        .expect("boot thread");
}

/// Ordered log of events shared between tasks, callbacks and the host.
#[derive(Clone, Default)]
pub(crate) struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push<S: Into<String>>(&self, event: S) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(event.into());
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Block the host until `event` has been recorded and return the log.
    pub(crate) fn wait_for(&self, event: &str) -> Vec<String> {
        let started = Instant::now();
        loop {
            let events = self.events();
            if events.iter().any(|e| e == event) {
                return events;
            }
            if started.elapsed() > WAIT_LIMIT {
                panic!("timed out waiting for {:?}, trace so far: {:?}", event, events);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
