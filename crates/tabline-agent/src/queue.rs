//! Steer / follow-up prompt queues (SPEC_FULL §4.4 "Queueing").
//!
//! Inbound prompts carry a `streamingBehavior`: `steer` prompts are drained
//! at the top of each loop iteration; `followUp` prompts are drained only
//! after `loop_done`.

use std::collections::VecDeque;

use tabline_core::QueueState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamingBehavior {
    Steer,
    FollowUp,
}

pub struct PromptQueue {
    steer: VecDeque<String>,
    follow_up: VecDeque<String>,
}

impl Default for PromptQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptQueue {
    pub fn new() -> Self {
        Self {
            steer: VecDeque::new(),
            follow_up: VecDeque::new(),
        }
    }

    pub fn push(&mut self, behavior: StreamingBehavior, prompt: impl Into<String>) {
        match behavior {
            StreamingBehavior::Steer => self.steer.push_back(prompt.into()),
            StreamingBehavior::FollowUp => self.follow_up.push_back(prompt.into()),
        }
    }

    /// Drain every queued steer prompt, in FIFO order (SPEC_FULL §4.4 step
    /// 2: "Dequeue any steer prompts").
    pub fn drain_steer(&mut self) -> Vec<String> {
        self.steer.drain(..).collect()
    }

    pub fn has_steer(&self) -> bool {
        !self.steer.is_empty()
    }

    /// Dequeue exactly one follow-up, used only after `loop_done`.
    pub fn pop_follow_up(&mut self) -> Option<String> {
        self.follow_up.pop_front()
    }

    pub fn has_follow_up(&self) -> bool {
        !self.follow_up.is_empty()
    }

    pub fn state(&self) -> QueueState {
        QueueState {
            steer: self.steer.len() as u32,
            follow_up: self.follow_up.len() as u32,
            total: (self.steer.len() + self.follow_up.len()) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steer_drains_fifo() {
        let mut q = PromptQueue::new();
        q.push(StreamingBehavior::Steer, "a");
        q.push(StreamingBehavior::Steer, "b");
        assert_eq!(q.drain_steer(), vec!["a".to_string(), "b".to_string()]);
        assert!(!q.has_steer());
    }

    #[test]
    fn follow_up_pops_one_at_a_time() {
        let mut q = PromptQueue::new();
        q.push(StreamingBehavior::FollowUp, "x");
        q.push(StreamingBehavior::FollowUp, "y");
        assert_eq!(q.pop_follow_up(), Some("x".to_string()));
        assert!(q.has_follow_up());
        assert_eq!(q.pop_follow_up(), Some("y".to_string()));
        assert!(!q.has_follow_up());
    }

    #[test]
    fn state_reports_counts() {
        let mut q = PromptQueue::new();
        q.push(StreamingBehavior::Steer, "a");
        q.push(StreamingBehavior::FollowUp, "b");
        let s = q.state();
        assert_eq!(s.steer, 1);
        assert_eq!(s.follow_up, 1);
        assert_eq!(s.total, 2);
    }
}
