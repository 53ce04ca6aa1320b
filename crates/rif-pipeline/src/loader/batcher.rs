//! Fixed-size windowing for streams of pending work.

/// Groups pushed items into windows of a fixed size.
///
/// Bounds the number of in-flight persistence tasks: the loader drains a
/// full window before submitting more, so memory use stays proportional
/// to the window size rather than the file size.
#[derive(Debug)]
pub struct BatchCollector<T> {
    window_size: usize,
    buffer: Vec<T>,
}

impl<T> BatchCollector<T> {
    pub fn new(window_size: usize) -> Self {
        assert!(window_size > 0, "window size must be positive");
        Self {
            window_size,
            buffer: Vec::with_capacity(window_size),
        }
    }

    /// Adds an item, returning the window when it fills. Items come back
    /// in the order they were pushed.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.buffer.push(item);
        if self.buffer.len() == self.window_size {
            Some(std::mem::replace(
                &mut self.buffer,
                Vec::with_capacity(self.window_size),
            ))
        } else {
            None
        }
    }

    /// Flushes the final partial window, if any.
    pub fn finish(&mut self) -> Option<Vec<T>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_fill_in_push_order() {
        let mut collector = BatchCollector::new(3);
        assert!(collector.push(1).is_none());
        assert!(collector.push(2).is_none());
        assert_eq!(collector.push(3), Some(vec![1, 2, 3]));
        assert!(collector.push(4).is_none());
        assert_eq!(collector.finish(), Some(vec![4]));
        assert_eq!(collector.finish(), None);
    }

    #[test]
    fn exact_multiple_leaves_nothing_to_flush() {
        let mut collector = BatchCollector::new(2);
        collector.push('a');
        assert_eq!(collector.push('b'), Some(vec!['a', 'b']));
        assert_eq!(collector.finish(), None);
    }
}
