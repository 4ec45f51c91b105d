use std::sync::Arc;

/// Strict weak ordering supplied by the caller: returns true when `a`
/// should come out of the queue before `b`.
pub type OrderFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Binary heap driven by an external comparator.
///
/// The standard library heap needs `Ord` on the element type; here the
/// ordering is a composed plugin value, so the heap carries it alongside
/// the items. `clone` deep-copies the items (sharing the comparator),
/// which is what the speculative per-node drain in reclaim relies on.
pub struct PriorityQueue<T> {
    items: Vec<T>,
    order: OrderFn<T>,
}

impl<T> PriorityQueue<T> {
    pub fn new(order: OrderFn<T>) -> Self {
        Self {
            items: Vec::new(),
            order,
        }
    }

    /// Heapify an initial set of items.
    pub fn with_items(order: OrderFn<T>, items: Vec<T>) -> Self {
        let mut queue = Self { items, order };
        if queue.items.len() > 1 {
            for i in (0..queue.items.len() / 2).rev() {
                queue.sift_down(i);
            }
        }
        queue
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    /// Remove and return the highest-priority item.
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        top
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if (self.order)(&self.items[idx], &self.items[parent]) {
                self.items.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut best = idx;
            if left < self.items.len() && (self.order)(&self.items[left], &self.items[best]) {
                best = left;
            }
            if right < self.items.len() && (self.order)(&self.items[right], &self.items[best]) {
                best = right;
            }
            if best == idx {
                break;
            }
            self.items.swap(idx, best);
            idx = best;
        }
    }
}

impl<T: Clone> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            order: Arc::clone(&self.order),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min_order() -> OrderFn<i32> {
        Arc::new(|a, b| a < b)
    }

    #[test]
    fn test_pop_follows_comparator() {
        let mut queue = PriorityQueue::new(min_order());
        for n in [5, 1, 4, 2, 3] {
            queue.push(n);
        }

        let drained: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_with_items_heapifies() {
        let mut queue = PriorityQueue::with_items(min_order(), vec![9, 3, 7, 1]);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut queue = PriorityQueue::new(min_order());
        queue.push(2);
        queue.push(1);

        assert_eq!(queue.peek(), Some(&1));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut queue = PriorityQueue::new(min_order());
        for n in [3, 1, 2] {
            queue.push(n);
        }

        let mut copy = queue.clone();
        assert_eq!(copy.pop(), Some(1));
        assert_eq!(copy.pop(), Some(2));

        // Draining the clone leaves the original untouched
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(1));
    }

    #[test]
    fn test_empty_pop() {
        let mut queue: PriorityQueue<i32> = PriorityQueue::new(min_order());
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }
}
