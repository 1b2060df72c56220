use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use parking_lot::Mutex;
use tracing::info;

use crate::kernel::task::{Task, TaskId};
use crate::kernel::task_manager::TaskManager;

/// The tick loop that drives a [TaskManager].
///
/// `execute` runs until the task list empties or `stop` is called, passing
///  each pass the measured duration of the previous frame. A minimum frame
///  time keeps an otherwise idle loop from spinning; every connection pump
///  is non-blocking, so the loop itself is the only place time is spent
///  waiting.
pub struct Kernel {
    manager: Arc<TaskManager>,
    min_frame_time: Mutex<Duration>,
    stop_requested: AtomicBool,
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::new()
    }
}

impl Kernel {
    pub fn new() -> Kernel {
        Kernel {
            manager: Arc::new(TaskManager::new("kernel")),
            min_frame_time: Mutex::new(Duration::from_millis(1)),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn add_task(&self, task: Arc<dyn Task>) -> anyhow::Result<TaskId> {
        self.manager.add_task(task)
    }

    pub fn remove_all_tasks(&self) {
        self.manager.remove_all_tasks();
    }

    pub fn set_min_frame_time(&self, min_frame_time: Duration) {
        *self.min_frame_time.lock() = min_frame_time;
    }

    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        if !self.manager.start_tasks() {
            bail!("one or more tasks failed to start");
        }
        info!("kernel executing");
        let mut last_frame = Instant::now();
        while !self.stop_requested.load(Ordering::Relaxed) && self.manager.has_at_least_one_task() {
            let now = Instant::now();
            let frame_time = now - last_frame;
            last_frame = now;
            self.manager.update_tasks(frame_time);

            let min_frame_time = *self.min_frame_time.lock();
            let elapsed = now.elapsed();
            if elapsed < min_frame_time {
                std::thread::sleep(min_frame_time - elapsed);
            }
        }
        self.manager.stop_tasks();
        self.stop_requested.store(false, Ordering::Relaxed);
        info!("kernel finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::timer::CountDownTimer;

    #[test]
    fn test_execute_ends_when_tasks_removed() {
        let kernel = Arc::new(Kernel::new());
        let timeout = {
            let manager = kernel.task_manager().clone();
            CountDownTimer::new(Duration::from_millis(50), "remove-all", move || {
                manager.remove_all_tasks();
            })
        };
        kernel.add_task(Arc::new(timeout)).unwrap();

        let started = Instant::now();
        kernel.execute().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
