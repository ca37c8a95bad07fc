//! Fixed-size frame rings

/// A ring of `N` frames, reused in place
///
/// The index only ever grows and is taken modulo `N` on every access.
#[derive(Clone, Debug)]
pub struct FrameRing<T, const N: usize> {
    frames: [T; N],
    idx: u16,
}

impl<T: Default + Copy, const N: usize> FrameRing<T, N> {
    /// Creates a ring of default frames
    pub fn new() -> Self {
        FrameRing {
            frames: [T::default(); N],
            idx: 0,
        }
    }
}

impl<T: Default + Copy, const N: usize> Default for FrameRing<T, N> {
    fn default() -> Self {
        FrameRing::new()
    }
}

impl<T, const N: usize> FrameRing<T, N> {
    /// The raw, ever-increasing index
    pub fn idx(&self) -> u16 {
        self.idx
    }

    /// The frame the index points to
    pub fn current(&self) -> &T {
        &self.frames[self.idx as usize % N]
    }

    /// The frame the index points to
    pub fn current_mut(&mut self) -> &mut T {
        &mut self.frames[self.idx as usize % N]
    }

    /// The frame `back` positions before the current one
    pub fn previous(&self, back: u16) -> &T {
        &self.frames[self.idx.wrapping_sub(back) as usize % N]
    }

    /// Moves to the next frame and returns it
    pub fn advance(&mut self) -> &mut T {
        self.idx = self.idx.wrapping_add(1);
        self.current_mut()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_wraps_by_modulus() {
        let mut ring: FrameRing<u8, 3> = FrameRing::new();
        *ring.current_mut() = 1;
        *ring.advance() = 2;
        *ring.advance() = 3;
        *ring.advance() = 4;

        assert_eq!(*ring.current(), 4);
        assert_eq!(*ring.previous(1), 3);
        assert_eq!(*ring.previous(2), 2);
        assert_eq!(*ring.previous(3), 4);
    }
}
