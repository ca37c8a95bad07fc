//! Binary semaphore guarding the exchanges of a service instance

/// A binary semaphore
///
/// A count of 1 means idle, 0 means an exchange is in flight. Events that
/// arrive while the count is 1 are unsolicited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Semaphore {
    count: u8,
}

impl Semaphore {
    /// Creates an idle semaphore
    pub const fn new() -> Self {
        Semaphore { count: 1 }
    }

    /// Takes the semaphore, returns `false` if it is already taken
    pub fn try_acquire(&mut self) -> bool {
        if self.count == 0 {
            return false;
        }
        self.count = 0;
        true
    }

    /// Gives the semaphore back
    ///
    /// Returns `false` if it wasn't taken, in which case nothing changes.
    pub fn release(&mut self) -> bool {
        if self.count == 1 {
            return false;
        }
        self.count = 1;
        true
    }

    /// The current count
    pub fn count(&self) -> u8 {
        self.count
    }

    /// Returns `true` while an exchange is in flight
    pub fn is_held(&self) -> bool {
        self.count == 0
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_stays_binary() {
        let mut sem = Semaphore::new();
        assert!(!sem.release());
        assert_eq!(sem.count(), 1);

        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        assert_eq!(sem.count(), 0);

        assert!(sem.release());
        assert!(!sem.release());
        assert_eq!(sem.count(), 1);
    }
}
