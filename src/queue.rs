//! Priority-ordered, capacity-bounded task queue.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::error::QueueError;
use crate::task::Task;

/// Pending work, ordered by descending priority.
///
/// Within a priority band insertion order is preserved: a new task is placed
/// before the first strictly-lower-priority element (stable insert, never a
/// re-sort). The front of the queue is always the highest-priority, oldest
/// task.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
    capacity: usize,
}

impl TaskQueue {
    /// Create a queue bounded at `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Insert a task in priority order. Fails when the queue is at capacity.
    pub fn push(&mut self, task: Task) -> Result<(), QueueError> {
        if self.tasks.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        let position = self
            .tasks
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(position, task);
        Ok(())
    }

    /// Re-insert a crash-recovered task at the very front, ahead of anything
    /// queued, regardless of priority.
    pub fn requeue_front(&mut self, task: Task) -> Result<(), QueueError> {
        if self.tasks.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        self.tasks.push_front(task);
        Ok(())
    }

    /// Pop the highest-priority task.
    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// Remove a queued task by ID. Only undispatched tasks live here, so this
    /// is exactly the `cancel` surface for the queue.
    pub fn remove(&mut self, id: Uuid) -> Option<Task> {
        let position = self.tasks.iter().position(|task| task.id == id)?;
        self.tasks.remove(position)
    }

    /// Look up a queued task by ID.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Highest priority currently queued, if any.
    pub fn peek_priority(&self) -> Option<crate::task::TaskPriority> {
        self.tasks.front().map(|task| task.priority)
    }

    /// Drain every queued task (shutdown path).
    pub fn drain(&mut self) -> Vec<Task> {
        self.tasks.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill percentage, 0–100.
    pub fn utilization_percent(&self) -> f32 {
        if self.capacity == 0 {
            return 100.0;
        }
        self.tasks.len() as f32 / self.capacity as f32 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskKind, TaskPriority};

    fn task(priority: TaskPriority) -> Task {
        Task::new(TaskKind::Generic, serde_json::Value::Null, priority)
    }

    #[test]
    fn pops_in_descending_priority_order() {
        let mut queue = TaskQueue::new(10);
        queue.push(task(TaskPriority::Low)).unwrap();
        queue.push(task(TaskPriority::Critical)).unwrap();
        queue.push(task(TaskPriority::Normal)).unwrap();

        assert_eq!(queue.pop().unwrap().priority, TaskPriority::Critical);
        assert_eq!(queue.pop().unwrap().priority, TaskPriority::Normal);
        assert_eq!(queue.pop().unwrap().priority, TaskPriority::Low);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn fifo_within_equal_priority() {
        let mut queue = TaskQueue::new(10);
        let first = task(TaskPriority::Normal);
        let second = task(TaskPriority::Normal);
        let first_id = first.id;
        let second_id = second.id;

        queue.push(first).unwrap();
        queue.push(task(TaskPriority::High)).unwrap();
        queue.push(second).unwrap();

        assert_eq!(queue.pop().unwrap().priority, TaskPriority::High);
        assert_eq!(queue.pop().unwrap().id, first_id);
        assert_eq!(queue.pop().unwrap().id, second_id);
    }

    #[test]
    fn rejects_when_full() {
        let mut queue = TaskQueue::new(5);
        for _ in 0..5 {
            queue.push(task(TaskPriority::Normal)).unwrap();
        }
        let err = queue.push(task(TaskPriority::Critical)).unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 5 }));
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn requeue_front_jumps_the_queue() {
        let mut queue = TaskQueue::new(10);
        queue.push(task(TaskPriority::Critical)).unwrap();

        let recovered = task(TaskPriority::Background);
        let recovered_id = recovered.id;
        queue.requeue_front(recovered).unwrap();

        assert_eq!(queue.pop().unwrap().id, recovered_id);
    }

    #[test]
    fn requeue_front_respects_capacity() {
        let mut queue = TaskQueue::new(1);
        queue.push(task(TaskPriority::Normal)).unwrap();
        assert!(queue.requeue_front(task(TaskPriority::Normal)).is_err());
    }

    #[test]
    fn demoted_task_lands_at_tail_of_new_band() {
        let mut queue = TaskQueue::new(10);
        let incumbent = task(TaskPriority::Low);
        let incumbent_id = incumbent.id;
        queue.push(incumbent).unwrap();
        queue.push(task(TaskPriority::Background)).unwrap();

        // A Normal task demoted to Low goes behind the existing Low task
        // but ahead of Background.
        let demoted = task(TaskPriority::Low);
        let demoted_id = demoted.id;
        queue.push(demoted).unwrap();

        assert_eq!(queue.pop().unwrap().id, incumbent_id);
        assert_eq!(queue.pop().unwrap().id, demoted_id);
        assert_eq!(queue.pop().unwrap().priority, TaskPriority::Background);
    }

    #[test]
    fn remove_only_affects_queued_tasks() {
        let mut queue = TaskQueue::new(10);
        let queued = task(TaskPriority::Normal);
        let id = queued.id;
        queue.push(queued).unwrap();

        assert!(queue.remove(id).is_some());
        assert!(queue.remove(id).is_none());
        assert!(queue.remove(Uuid::new_v4()).is_none());
    }

    #[test]
    fn utilization_tracks_fill() {
        let mut queue = TaskQueue::new(4);
        assert_eq!(queue.utilization_percent(), 0.0);
        queue.push(task(TaskPriority::Normal)).unwrap();
        queue.push(task(TaskPriority::Normal)).unwrap();
        assert_eq!(queue.utilization_percent(), 50.0);
    }

    #[test]
    fn drain_empties_the_queue() {
        let mut queue = TaskQueue::new(10);
        queue.push(task(TaskPriority::Normal)).unwrap();
        queue.push(task(TaskPriority::High)).unwrap();
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
