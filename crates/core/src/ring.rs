//! Bounded, single-writer/multiple-reader line ring buffer.
//!
//! Used both by the daemon-side companion output ring (survives a
//! companion restart) and by the companion child's own mirror ring (lets
//! it replay history to a freshly restarted daemon). See `spec.md` §9
//! "Ring-buffer ownership".

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct LineRing<T> {
    capacity: usize,
    lines: VecDeque<T>,
}

impl<T> LineRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), lines: VecDeque::with_capacity(capacity.min(1024)) }
    }

    pub fn push(&mut self, line: T) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The most recent `n` entries, oldest first. `n == 0` means "none";
    /// callers asking for "everything" should pass `usize::MAX`.
    pub fn tail(&self, n: usize) -> Vec<T>
    where
        T: Clone,
    {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let mut ring = LineRing::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.snapshot(), vec![2, 3, 4]);
    }

    #[test]
    fn tail_returns_most_recent_n() {
        let mut ring = LineRing::new(10);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.tail(2), vec![3, 4]);
        assert_eq!(ring.tail(100), vec![0, 1, 2, 3, 4]);
        assert_eq!(ring.tail(0), Vec::<i32>::new());
    }
}
