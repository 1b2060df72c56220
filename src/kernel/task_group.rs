use std::sync::Arc;
use std::time::Duration;

use crate::kernel::task::{Task, TaskId, DEFAULT_PRIORITY};
use crate::kernel::task_manager::TaskManager;

/// A task that owns a nested [TaskManager], for building task hierarchies.
///  Starting, stopping, pausing and updating the group forwards to its
///  members.
pub struct TaskGroup {
    name: String,
    priority: u32,
    manager: TaskManager,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> TaskGroup {
        TaskGroup::with_priority(name, DEFAULT_PRIORITY)
    }

    pub fn with_priority(name: impl Into<String>, priority: u32) -> TaskGroup {
        let name = name.into();
        TaskGroup {
            manager: TaskManager::new(name.clone()),
            name,
            priority,
        }
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn add_task(&self, task: Arc<dyn Task>) -> anyhow::Result<TaskId> {
        self.manager.add_task(task)
    }
}

impl Task for TaskGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn on_start(&self) -> bool {
        self.manager.start_tasks()
    }

    fn on_stop(&self) {
        self.manager.stop_tasks();
    }

    fn on_pause(&self, application_pause: bool) {
        self.manager.pause_all_active_tasks(application_pause);
    }

    fn on_resume(&self, application_resume: bool) {
        self.manager
            .resume_all_previously_active_tasks(application_resume);
    }

    fn update(&self, frame_time: Duration) {
        self.manager.update_tasks(frame_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        name: String,
        count: AtomicUsize,
    }

    impl Task for CountingTask {
        fn name(&self) -> &str {
            &self.name
        }
        fn update(&self, _: Duration) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counting(name: &str) -> Arc<CountingTask> {
        Arc::new(CountingTask {
            name: name.to_string(),
            count: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_hierarchy_updates_all_members() {
        let manager = TaskManager::new("root");
        let group = Arc::new(TaskGroup::new("group"));
        let task_a1 = counting("taskA1");
        let task_a2 = counting("taskA2");
        let task_b1 = counting("taskB1");
        let task_b2 = counting("taskB2");

        group.add_task(task_b1.clone()).unwrap();
        group.add_task(task_b2.clone()).unwrap();
        manager.add_task(group.clone()).unwrap();
        assert!(manager.start_tasks());
        manager.add_task(task_a1.clone()).unwrap();
        manager.add_task(task_a2.clone()).unwrap();

        // member tasks are found in their own manager, not the root
        assert!(manager.find_task("taskA1").is_some());
        assert!(manager.find_task("taskB1").is_none());
        assert!(group.manager().find_task("taskB1").is_some());

        manager.update_tasks(Duration::from_millis(16));
        assert_eq!(task_a1.count.load(Ordering::Relaxed), 1);
        assert_eq!(task_a2.count.load(Ordering::Relaxed), 1);
        assert_eq!(task_b1.count.load(Ordering::Relaxed), 1);
        assert_eq!(task_b2.count.load(Ordering::Relaxed), 1);
    }
}
