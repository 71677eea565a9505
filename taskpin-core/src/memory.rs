//! Conversation memory for the dispatch loop.
//!
//! A sliding window of recent messages per conversation thread. All chat
//! utterances share one fixed thread id, so the window is the model's only
//! memory between turns. Turns are appended whole, which keeps concurrent
//! utterances from interleaving their tool calls and results.

use crate::types::{Message, Role};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Sliding window of recent messages for a single thread.
#[derive(Debug, Clone, Default)]
pub struct ShortTermMemory {
    messages: VecDeque<Message>,
    window_size: usize,
    total_messages_seen: usize,
}

impl ShortTermMemory {
    pub fn new(window_size: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            window_size,
            total_messages_seen: 0,
        }
    }

    /// Add a message, dropping the oldest ones once the window is full.
    pub fn add(&mut self, message: Message) {
        self.messages.push_back(message);
        self.total_messages_seen += 1;
        self.trim();
    }

    /// Keep at most `window_size` messages and never start the window in the
    /// middle of a turn: the oldest kept message is always a user message.
    fn trim(&mut self) {
        while self.messages.len() > self.window_size {
            self.messages.pop_front();
        }
        while let Some(front) = self.messages.front() {
            if front.role == Role::User {
                break;
            }
            self.messages.pop_front();
        }
    }

    pub fn to_messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn total_messages_seen(&self) -> usize {
        self.total_messages_seen
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

/// Thread-keyed conversation store shared by concurrent turns.
pub struct ConversationMemory {
    window_size: usize,
    threads: Mutex<HashMap<String, ShortTermMemory>>,
}

impl ConversationMemory {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            threads: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ShortTermMemory>> {
        self.threads.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The current window for `thread_id`, oldest first.
    pub fn history(&self, thread_id: &str) -> Vec<Message> {
        self.lock()
            .get(thread_id)
            .map(ShortTermMemory::to_messages)
            .unwrap_or_default()
    }

    /// Append one finished turn.
    pub fn record_turn(&self, thread_id: &str, turn: Vec<Message>) {
        let mut threads = self.lock();
        let memory = threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ShortTermMemory::new(self.window_size));
        for message in turn {
            memory.add(message);
        }
    }

    pub fn clear(&self, thread_id: &str) {
        if let Some(memory) = self.lock().get_mut(thread_id) {
            memory.clear();
        }
    }
}
