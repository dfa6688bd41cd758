//! Bounded command path from the presentation layer into the simulation.
//!
//! Presentation threads hold cloneable [`CommandSender`]s and push opaque
//! [`CommandToken`]s. The simulation thread owns the [`CommandQueue`] and
//! drains it once per turn, in FIFO order. This is the only way anything
//! outside the simulation thread can cause a mutation.
//!
//! # Example
//!
//! ```
//! use cairn_world::command::{CommandQueue, CommandToken};
//!
//! let mut queue = CommandQueue::new(4);
//! let sender = queue.sender();
//! sender.try_send(CommandToken::new(b"move north".to_vec())).unwrap();
//!
//! let drained = queue.drain();
//! assert_eq!(drained.len(), 1);
//! assert_eq!(drained[0].as_bytes(), b"move north");
//! ```

use crossbeam_channel::{Receiver, Sender, TrySendError};

use serde::{Deserialize, Serialize};

use crate::WorldError;

/// An opaque command. Its meaning belongs to the game rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandToken(Vec<u8>);

impl CommandToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Producer handle, cheap to clone and safe to send to other threads.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: Sender<CommandToken>,
}

impl CommandSender {
    /// Queue a command without blocking.
    pub fn try_send(&self, token: CommandToken) -> Result<(), WorldError> {
        self.tx.try_send(token).map_err(|e| match e {
            TrySendError::Full(_) => WorldError::QueueFull,
            TrySendError::Disconnected(_) => WorldError::QueueClosed,
        })
    }
}

/// Consumer side, owned by the simulation thread.
#[derive(Debug)]
pub struct CommandQueue {
    tx: Sender<CommandToken>,
    rx: Receiver<CommandToken>,
    capacity: usize,
}

impl CommandQueue {
    /// Create a queue holding at most `capacity` pending commands.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "command queue capacity must be positive");
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// A new producer handle.
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take every pending command in arrival order.
    pub fn drain(&mut self) -> Vec<CommandToken> {
        self.rx.try_iter().collect()
    }

    /// Discard every pending command. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        self.drain().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(b: u8) -> CommandToken {
        CommandToken::new(vec![b])
    }

    #[test]
    fn drains_in_fifo_order() {
        let mut q = CommandQueue::new(8);
        let tx = q.sender();
        for b in 0..5 {
            tx.try_send(token(b)).unwrap();
        }
        let bytes: Vec<u8> = q.drain().iter().map(|t| t.as_bytes()[0]).collect();
        assert_eq!(bytes, vec![0, 1, 2, 3, 4]);
        assert!(q.drain().is_empty());
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let q = CommandQueue::new(2);
        let tx = q.sender();
        tx.try_send(token(1)).unwrap();
        tx.try_send(token(2)).unwrap();
        assert!(matches!(tx.try_send(token(3)), Err(WorldError::QueueFull)));
    }

    #[test]
    fn draining_frees_capacity() {
        let mut q = CommandQueue::new(2);
        let tx = q.sender();
        tx.try_send(token(1)).unwrap();
        tx.try_send(token(2)).unwrap();
        assert!(matches!(tx.try_send(token(3)), Err(WorldError::QueueFull)));
        assert_eq!(q.drain().len(), 2);
        tx.try_send(token(4)).unwrap();
        assert_eq!(q.drain(), vec![token(4)]);
    }

    #[test]
    fn dropped_queue_closes_senders() {
        let q = CommandQueue::new(2);
        let tx = q.sender();
        drop(q);
        assert!(matches!(tx.try_send(token(1)), Err(WorldError::QueueClosed)));
    }

    #[test]
    fn senders_work_across_threads() {
        let mut q = CommandQueue::new(64);
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let tx = q.sender();
                std::thread::spawn(move || {
                    for _ in 0..8 {
                        tx.try_send(token(t)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.clear(), 32);
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_panics() {
        let _ = CommandQueue::new(0);
    }
}
