use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error};

use crate::kernel::task::{Task, TaskId};

pub type Action = Box<dyn FnOnce() + Send>;

struct TaskEntry {
    task: Arc<dyn Task>,
    priority: u32,
    started: bool,
    removed: bool,
    paused: bool,
    waiting_for_resume: bool,
    waiting_for_pause_processing: bool,
}

struct Scheduler {
    name: String,
    entries: FxHashMap<TaskId, TaskEntry>,
    task_list: Vec<TaskId>,
    active_list: Vec<TaskId>,
    previously_active: Vec<TaskId>,
    post_update_actions: Vec<Action>,
    next_id: u64,
    executing: bool,
    paused: bool,
    updating: bool,
    profiling_enabled: bool,
    profile: FxHashMap<String, (Duration, u64)>,
}

enum ListAction {
    Remove,
    ProcessPause,
    ProcessResume,
    Keep,
}

/// Priority-ordered cooperative scheduler.
///
/// Tasks run in ascending priority order (ties keep insertion order) once per
///  [TaskManager::update_tasks] call. Structural changes requested while an
///  update pass is running - add, remove, pause, resume - are recorded as
///  flags in the task table and applied at a single reconciliation point
///  after the pass, so the list being iterated is never mutated: no task is
///  updated twice, none is skipped, and tasks added mid-pass first run in the
///  following pass. Removal marks are honoured immediately: a task removed
///  mid-pass will not run again even later in the same pass.
pub struct TaskManager {
    inner: Mutex<Scheduler>,
}

impl TaskManager {
    pub fn new(name: impl Into<String>) -> TaskManager {
        TaskManager {
            inner: Mutex::new(Scheduler {
                name: name.into(),
                entries: FxHashMap::default(),
                task_list: Vec::new(),
                active_list: Vec::new(),
                previously_active: Vec::new(),
                post_update_actions: Vec::new(),
                next_id: 1,
                executing: false,
                paused: false,
                updating: false,
                profiling_enabled: false,
                profile: FxHashMap::default(),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn is_executing(&self) -> bool {
        self.inner.lock().executing
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Add a task. While the manager is executing the task's `on_start` is
    ///  called first and a failure aborts the add. Adding during an update
    ///  pass stages the task; it first runs in the following pass.
    pub fn add_task(&self, task: Arc<dyn Task>) -> anyhow::Result<TaskId> {
        let existing = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .find(|(_, entry)| Arc::ptr_eq(&entry.task, &task))
                .map(|(&id, entry)| (id, entry.removed))
        };
        if let Some((_, false)) = existing {
            bail!("task '{}' has already been added", task.name());
        }

        if self.is_executing() && !task.on_start() {
            bail!("task '{}' failed to start", task.name());
        }

        let mut inner = self.inner.lock();
        let executing = inner.executing;
        let updating = inner.updating;

        // a task removed earlier in this pass may be added back before the
        //  removal was physically processed
        if let Some((id, true)) = existing {
            let mut revived = false;
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.removed = false;
                entry.paused = false;
                entry.started = executing;
                entry.waiting_for_resume = true;
                entry.waiting_for_pause_processing = false;
                revived = true;
            }
            if revived {
                if !updating {
                    Self::update_lists(&mut inner);
                }
                return Ok(id);
            }
        }

        let id = TaskId(inner.next_id);
        inner.next_id += 1;
        let priority = task.priority();
        inner.entries.insert(
            id,
            TaskEntry {
                task,
                priority,
                started: executing,
                removed: false,
                paused: false,
                waiting_for_resume: updating,
                waiting_for_pause_processing: false,
            },
        );
        inner.task_list.push(id);
        if !updating {
            inner.active_list.push(id);
            Self::sort_active(&mut inner);
        }
        Ok(id)
    }

    /// Remove a task. Mid-update the removal is marked and processed at the
    ///  end of the pass; the task is not updated again either way.
    pub fn remove_task(&self, id: TaskId) -> bool {
        let (task, stop) = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return false;
            };
            if entry.removed {
                return false;
            }
            entry.removed = true;
            let stop = entry.started;
            entry.started = false;
            let task = entry.task.clone();
            inner.previously_active.retain(|x| *x != id);
            if !inner.updating {
                Self::update_lists(&mut inner);
            }
            (task, stop)
        };
        if stop {
            task.on_stop();
        }
        true
    }

    /// Remove the first task with the given name. Names are not cached at
    ///  add time; the comparison is against current task names.
    pub fn remove_task_named(&self, name: &str) -> bool {
        match self.find_task(name) {
            Some(id) => self.remove_task(id),
            None => false,
        }
    }

    pub fn remove_all_tasks(&self) {
        let ids: Vec<TaskId> = {
            let inner = self.inner.lock();
            inner
                .task_list
                .iter()
                .filter(|id| inner.entries.get(id).map(|e| !e.removed).unwrap_or(false))
                .copied()
                .collect()
        };
        for id in ids {
            self.remove_task(id);
        }
    }

    pub fn has_task(&self, id: TaskId) -> bool {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|entry| !entry.removed)
            .unwrap_or(false)
    }

    pub fn find_task(&self, name: &str) -> Option<TaskId> {
        let inner = self.inner.lock();
        inner
            .task_list
            .iter()
            .find(|id| {
                inner
                    .entries
                    .get(id)
                    .map(|entry| !entry.removed && entry.task.name() == name)
                    .unwrap_or(false)
            })
            .copied()
    }

    pub fn number_of_tasks(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .filter(|entry| !entry.removed)
            .count()
    }

    pub fn number_of_active_tasks(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .active_list
            .iter()
            .filter(|id| {
                inner
                    .entries
                    .get(id)
                    .map(|entry| !entry.removed && !entry.paused)
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn has_at_least_one_task(&self) -> bool {
        self.number_of_tasks() > 0
    }

    /// Change the manager to executing and start every task. If any task
    ///  fails to start everything already started is stopped again and false
    ///  is returned.
    pub fn start_tasks(&self) -> bool {
        let snapshot: Vec<(TaskId, Arc<dyn Task>)> = {
            let mut inner = self.inner.lock();
            inner.executing = true;
            inner
                .task_list
                .iter()
                .filter_map(|id| {
                    let entry = inner.entries.get(id)?;
                    if entry.removed {
                        return None;
                    }
                    Some((*id, entry.task.clone()))
                })
                .collect()
        };
        for (id, task) in snapshot {
            if task.on_start() {
                if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
                    entry.started = true;
                }
            } else {
                error!("error starting '{}'", task.name());
                if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
                    entry.paused = true;
                }
                self.stop_tasks();
                return false;
            }
        }
        true
    }

    /// Change the manager to not executing and stop every started task. Task
    ///  lists are left alone so the manager can be started again.
    pub fn stop_tasks(&self) {
        let to_stop: Vec<Arc<dyn Task>> = {
            let mut inner = self.inner.lock();
            inner.executing = false;
            let Scheduler {
                entries, task_list, ..
            } = &mut *inner;
            task_list
                .iter()
                .filter_map(|id| {
                    let entry = entries.get_mut(id)?;
                    if entry.removed || !entry.started {
                        return None;
                    }
                    entry.started = false;
                    Some(entry.task.clone())
                })
                .collect()
        };
        for task in to_stop {
            task.on_stop();
        }
    }

    pub fn pause_task(&self, id: TaskId) -> bool {
        self.pause_task_internal(id, false)
    }

    pub fn resume_task(&self, id: TaskId) -> bool {
        self.resume_task_internal(id, false)
    }

    fn pause_task_internal(&self, id: TaskId, application_pause: bool) -> bool {
        let task = {
            let mut inner = self.inner.lock();
            let updating = inner.updating;
            let manager_paused = inner.paused;
            let Some(entry) = inner.entries.get_mut(&id) else {
                return false;
            };
            if entry.removed || entry.paused {
                return false;
            }
            entry.paused = true;
            entry.waiting_for_resume = false;
            let task = entry.task.clone();
            if updating {
                entry.waiting_for_pause_processing = true;
            } else {
                inner.active_list.retain(|x| *x != id);
                if !manager_paused {
                    inner.previously_active.retain(|x| *x != id);
                }
            }
            task
        };
        task.on_pause(application_pause);
        true
    }

    fn resume_task_internal(&self, id: TaskId, application_resume: bool) -> bool {
        let task = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return false;
            };
            if entry.removed || !entry.paused {
                return false;
            }
            entry.paused = false;
            entry.waiting_for_pause_processing = false;
            entry.waiting_for_resume = true;
            let task = entry.task.clone();
            if !inner.updating {
                Self::update_lists(&mut inner);
            }
            task
        };
        task.on_resume(application_resume);
        true
    }

    /// Pause every active pausable task, remembering exactly the set that was
    ///  active, so a later resume restores exactly that set. Idempotent: a
    ///  second pause while already paused is a no-op.
    pub fn pause_all_active_tasks(&self, application_pause: bool) {
        let to_notify: Vec<Arc<dyn Task>> = {
            let mut inner = self.inner.lock();
            if inner.paused {
                return;
            }
            inner.paused = true;
            let updating = inner.updating;
            let mut to_notify = Vec::new();
            let Scheduler {
                entries,
                task_list,
                active_list,
                previously_active,
                ..
            } = &mut *inner;
            for id in task_list.iter() {
                let Some(entry) = entries.get_mut(id) else {
                    continue;
                };
                if entry.removed || entry.paused {
                    continue;
                }
                previously_active.push(*id);
                if entry.task.is_pausable() {
                    entry.paused = true;
                    entry.waiting_for_resume = false;
                    if updating {
                        entry.waiting_for_pause_processing = true;
                    } else {
                        active_list.retain(|x| x != id);
                    }
                    to_notify.push(entry.task.clone());
                }
            }
            to_notify
        };
        for task in to_notify {
            task.on_pause(application_pause);
        }
    }

    /// Resume exactly the tasks that were active at pause time, regardless of
    ///  tasks added or removed while paused.
    pub fn resume_all_previously_active_tasks(&self, application_resume: bool) {
        let to_notify: Vec<Arc<dyn Task>> = {
            let mut inner = self.inner.lock();
            if !inner.paused {
                return;
            }
            inner.paused = false;
            let drained = std::mem::take(&mut inner.previously_active);
            let mut to_notify = Vec::new();
            for id in drained {
                let Some(entry) = inner.entries.get_mut(&id) else {
                    continue;
                };
                if entry.removed || !entry.paused {
                    continue;
                }
                entry.paused = false;
                entry.waiting_for_pause_processing = false;
                entry.waiting_for_resume = true;
                to_notify.push(entry.task.clone());
            }
            if !inner.updating {
                Self::update_lists(&mut inner);
            }
            to_notify
        };
        for task in to_notify {
            task.on_resume(application_resume);
        }
    }

    /// Resume every paused task without changing the manager's own paused
    ///  state.
    pub fn resume_all_tasks(&self, application_resume: bool) {
        let ids: Vec<TaskId> = {
            let inner = self.inner.lock();
            inner.task_list.clone()
        };
        for id in ids {
            self.resume_task_internal(id, application_resume);
        }
    }

    /// Update all active tasks in priority order, then run queued post-update
    ///  actions and reconcile deferred structural changes.
    pub fn update_tasks(&self, frame_time: Duration) {
        let (snapshot, profiling) = {
            let mut inner = self.inner.lock();
            inner.updating = true;
            let snapshot: Vec<(TaskId, Arc<dyn Task>)> = inner
                .active_list
                .iter()
                .filter_map(|id| inner.entries.get(id).map(|entry| (*id, entry.task.clone())))
                .collect();
            (snapshot, inner.profiling_enabled)
        };

        for (id, task) in snapshot {
            // flags are re-checked every iteration: a task removed or paused
            //  earlier in this same pass must not run
            let skip = {
                let inner = self.inner.lock();
                inner
                    .entries
                    .get(&id)
                    .map(|entry| entry.removed || entry.paused)
                    .unwrap_or(true)
            };
            if skip {
                continue;
            }
            if profiling {
                let started = Instant::now();
                task.update(frame_time);
                let elapsed = started.elapsed();
                let mut inner = self.inner.lock();
                let checkpoint = inner
                    .profile
                    .entry(task.name().to_string())
                    .or_insert((Duration::ZERO, 0));
                checkpoint.0 += elapsed;
                checkpoint.1 += 1;
            } else {
                task.update(frame_time);
            }
        }

        let actions: Vec<Action> = {
            let mut inner = self.inner.lock();
            inner.updating = false;
            std::mem::take(&mut inner.post_update_actions)
        };
        for action in actions {
            action();
        }

        Self::update_lists(&mut self.inner.lock());
    }

    /// Queue an action to run after the current (or, if none is in progress,
    ///  the next) update pass completes. Each action runs exactly once, in
    ///  queue order, and cannot be cancelled.
    pub fn queue_post_update_action(&self, action: impl FnOnce() + Send + 'static) {
        self.inner.lock().post_update_actions.push(Box::new(action));
    }

    pub fn set_profiling_enabled(&self, enabled: bool) {
        self.inner.lock().profiling_enabled = enabled;
    }

    /// Accumulated (total update time, update count) per task name since
    ///  profiling was enabled.
    pub fn profile_snapshot(&self) -> Vec<(String, Duration, u64)> {
        self.inner
            .lock()
            .profile
            .iter()
            .map(|(name, (total, count))| (name.clone(), *total, *count))
            .collect()
    }

    /// The single structural mutation point: physically erase removed tasks
    ///  and splice staged pause/resume transitions into the active list.
    fn update_lists(inner: &mut Scheduler) {
        let ids: Vec<TaskId> = inner.task_list.clone();
        for id in ids {
            let action = {
                let Some(entry) = inner.entries.get_mut(&id) else {
                    continue;
                };
                if entry.removed {
                    ListAction::Remove
                } else if entry.waiting_for_pause_processing {
                    entry.waiting_for_pause_processing = false;
                    ListAction::ProcessPause
                } else if entry.waiting_for_resume {
                    entry.waiting_for_resume = false;
                    entry.priority = entry.task.priority();
                    ListAction::ProcessResume
                } else {
                    ListAction::Keep
                }
            };
            match action {
                ListAction::Remove => {
                    debug!("removing {} from '{}'", id, inner.name);
                    inner.entries.remove(&id);
                    inner.task_list.retain(|x| *x != id);
                    inner.active_list.retain(|x| *x != id);
                    inner.previously_active.retain(|x| *x != id);
                }
                ListAction::ProcessPause => {
                    inner.active_list.retain(|x| *x != id);
                    // while the whole manager is paused the task arrived in
                    //  the previously-active list as part of that pause, so
                    //  that list is left alone
                    if !inner.paused {
                        inner.previously_active.retain(|x| *x != id);
                    }
                }
                ListAction::ProcessResume => {
                    if !inner.active_list.contains(&id) {
                        inner.active_list.push(id);
                        inner.previously_active.retain(|x| *x != id);
                    }
                }
                ListAction::Keep => {}
            }
        }
        Self::sort_active(inner);
    }

    fn sort_active(inner: &mut Scheduler) {
        let Scheduler {
            entries,
            active_list,
            ..
        } = inner;
        // stable: tasks with equal priority keep insertion order
        active_list.sort_by_key(|id| entries.get(id).map(|e| e.priority).unwrap_or(u32::MAX));
    }
}
