//! Deferred work
//!
//! Interrupt-context handlers must not block. They post what they produced
//! to a bounded queue and the task context drains it later.

use heapless::Deque;

use crate::error::Error;


/// A bounded single-consumer queue with a non-blocking push
#[derive(Clone, Debug)]
pub struct Deferred<T, const N: usize> {
    queue: Deque<T, N>,
    overflows: u32,
}

impl<T, const N: usize> Deferred<T, N> {
    /// Creates an empty queue
    pub const fn new() -> Self {
        Deferred {
            queue: Deque::new(),
            overflows: 0,
        }
    }

    /// Posts `item`, dropping it if the queue is full
    pub fn post(&mut self, item: T) -> Result<(), Error> {
        self.queue.push_back(item).map_err(|_| {
            self.overflows = self.overflows.wrapping_add(1);
            Error::QueueFull
        })
    }

    /// Takes the oldest item
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of items dropped because the queue was full
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// Drops every queued item
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl<T, const N: usize> Default for Deferred<T, N> {
    fn default() -> Self {
        Deferred::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_counts_overflows() {
        let mut queue: Deferred<u8, 2> = Deferred::new();
        assert_eq!(queue.post(1), Ok(()));
        assert_eq!(queue.post(2), Ok(()));
        assert_eq!(queue.post(3), Err(Error::QueueFull));
        assert_eq!(queue.overflows(), 1);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
    }
}
