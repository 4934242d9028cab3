//! Property tests for the drop-oldest distribution queue

use proptest::prelude::*;
use ps_session::BoundedQueue;

fn drain(queue: &BoundedQueue<u32>) -> Vec<u32> {
    std::iter::from_fn(|| queue.pop()).collect()
}

proptest! {
    #[test]
    fn push_keeps_newest_items_in_order(
        capacity in 1usize..32,
        items in prop::collection::vec(any::<u32>(), 0..100),
    ) {
        let queue = BoundedQueue::new(capacity);
        for &item in &items {
            queue.push(item);
            prop_assert!(queue.len() <= capacity);
        }

        let evicted = items.len().saturating_sub(capacity);
        let metrics = queue.metrics();
        prop_assert_eq!(metrics.total_pushed, items.len() as u64);
        prop_assert_eq!(metrics.total_dropped, evicted as u64);
        prop_assert_eq!(drain(&queue), items[evicted..].to_vec());
    }

    #[test]
    fn try_push_never_evicts(
        capacity in 1usize..32,
        items in prop::collection::vec(any::<u32>(), 0..100),
    ) {
        let queue = BoundedQueue::new(capacity);
        let accepted: Vec<u32> = items
            .iter()
            .copied()
            .filter(|&item| queue.try_push(item).is_ok())
            .collect();

        prop_assert_eq!(accepted.len(), items.len().min(capacity));
        prop_assert_eq!(queue.metrics().total_dropped, 0);
        prop_assert_eq!(drain(&queue), items[..accepted.len()].to_vec());
    }

    #[test]
    fn shrinking_capacity_keeps_newest(
        items in prop::collection::vec(any::<u32>(), 1..50),
        capacity in 1usize..10,
    ) {
        let queue = BoundedQueue::new(64);
        for &item in &items {
            queue.push(item);
        }
        queue.set_capacity(capacity);

        let kept = drain(&queue);
        prop_assert_eq!(kept.len(), items.len().min(capacity));
        prop_assert_eq!(&kept[..], &items[items.len() - kept.len()..]);
    }
}
