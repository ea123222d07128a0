//! A concurrent FIFO queue for producer/consumer hand-offs.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// An unbounded, lock-protected FIFO queue.
///
/// Any number of threads may push. Consumers either block until a value is
/// available, block with a timeout, or poll.
pub struct ConcurrentQueue<T> {
    queue: Mutex<VecDeque<T>>,
    cv: Condvar,
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }
}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a value to the back of the queue. Never blocks on consumers.
    pub fn push(&self, value: T) {
        self.queue.lock().push_back(value);
        self.cv.notify_one();
    }

    /// Pop the value at the front of the queue, blocking while it is empty.
    pub fn pop(&self) -> T {
        let mut queue = self.queue.lock();
        loop {
            if let Some(value) = queue.pop_front() {
                return value;
            }
            self.cv.wait(&mut queue);
        }
    }

    /// Pop the value at the front of the queue, blocking for at most `timeout`.
    ///
    /// # Returns
    ///
    /// The value, or `None` if the queue stayed empty for the whole timeout.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut queue = self.queue.lock();
        self.cv.wait_while_for(&mut queue, |queue| queue.is_empty(), timeout);
        queue.pop_front()
    }

    /// Pop the value at the front of the queue without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use more_asserts::assert_ge;
    use more_asserts::assert_lt;
    use quickcheck::quickcheck;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = ConcurrentQueue::new();
        for i in 0..10 {
            queue.push(i);
        }
        for i in 0..10 {
            assert_eq!(queue.pop(), i);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_producer_consumer() {
        let queue = Arc::new(ConcurrentQueue::new());
        let count = 1000;

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..count {
                    queue.push(i);
                }
            })
        };
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..count {
                    assert_eq!(queue.pop(), i);
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }

    #[test]
    fn test_pop_timeout_empty() {
        let queue: ConcurrentQueue<u32> = ConcurrentQueue::new();
        let start = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(300)).is_none());
        assert_ge!(start.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let queue = Arc::new(ConcurrentQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                queue.push(1234);
            })
        };

        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_secs(5)), Some(1234));
        assert_lt!(start.elapsed(), Duration::from_secs(1));
        producer.join().unwrap();
    }

    #[test]
    fn test_try_pop() {
        let queue = ConcurrentQueue::new();
        assert_eq!(queue.try_pop(), None);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some("a"));
        assert_eq!(queue.try_pop(), Some("b"));
        assert_eq!(queue.try_pop(), None);
    }

    quickcheck! {
        fn prop_every_value_popped_once(batches: Vec<Vec<u16>>) -> bool {
            let queue = Arc::new(ConcurrentQueue::new());
            let mut expected = HashSet::new();
            let mut producers = Vec::new();
            for (producer, batch) in batches.into_iter().take(8).enumerate() {
                let batch: Vec<(usize, u16)> =
                    batch.into_iter().enumerate().map(|(i, _)| (producer, i as u16)).collect();
                expected.extend(batch.iter().copied());
                let queue = queue.clone();
                producers.push(thread::spawn(move || {
                    for value in batch {
                        queue.push(value);
                    }
                }));
            }

            let consumers: Vec<_> = (0..2)
                .map(|_| {
                    let queue = queue.clone();
                    thread::spawn(move || {
                        let mut seen = Vec::new();
                        while let Some(value) = queue.pop_timeout(Duration::from_millis(100)) {
                            seen.push(value);
                        }
                        seen
                    })
                })
                .collect();

            for producer in producers {
                producer.join().unwrap();
            }
            let mut seen = HashSet::new();
            let mut total = 0;
            for consumer in consumers {
                for value in consumer.join().unwrap() {
                    seen.insert(value);
                    total += 1;
                }
            }
            while let Some(value) = queue.try_pop() {
                seen.insert(value);
                total += 1;
            }
            total == expected.len() && seen == expected
        }
    }
}
