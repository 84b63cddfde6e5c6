use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

/// FIFO of submission ids waiting for a worker.
pub struct JudgeQueue {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl Default for JudgeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JudgeQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, submission_id: String) {
        self.queue.lock().await.push_back(submission_id);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> String {
        loop {
            if let Some(submission_id) = self.queue.lock().await.pop_front() {
                return submission_id;
            }
            self.notify.notified().await;
        }
    }
}
