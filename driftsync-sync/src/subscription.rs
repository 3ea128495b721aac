//! Handles for background work started by a subscribe call.

use tokio::task::JoinHandle;

/// Disposer for a subscription. Dropping it (or calling
/// [`Subscription::unsubscribe`]) stops every task it owns.
#[derive(Debug, Default)]
#[must_use = "dropping a Subscription stops it"]
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { tasks: vec![task] }
    }

    /// Adds another task torn down with this subscription.
    pub fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// True while any owned task is still running.
    pub fn is_active(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stops the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
