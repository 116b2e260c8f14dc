use proptest::prelude::*;
use vnet_virtio::layout::{resolve, VirtioRegion, MODERN_BAR_SIZE};
use vnet_virtio::VirtioNetPciProps;

#[test]
fn windows_are_disjoint_and_inside_the_bar() {
    for (i, a) in VirtioRegion::ALL.iter().enumerate() {
        assert!(a.offset() + a.size() <= MODERN_BAR_SIZE, "{a:?}");
        for b in &VirtioRegion::ALL[i + 1..] {
            let disjoint =
                a.offset() + a.size() <= b.offset() || b.offset() + b.size() <= a.offset();
            assert!(disjoint, "{a:?} overlaps {b:?}");
        }
    }
}

proptest! {
    #[test]
    fn unspecified_vectors_follow_the_queue_count(queues in 0u16..=64) {
        let props = VirtioNetPciProps { queues, ..Default::default() };
        prop_assert_eq!(props.nvectors(), 2 * queues.max(1) + 2);
    }

    #[test]
    fn explicit_vectors_are_used_as_is(vectors in 1u16..=2048, queues in 0u16..=64) {
        let props = VirtioNetPciProps { vectors: Some(vectors), queues, ..Default::default() };
        prop_assert_eq!(props.nvectors(), vectors);
    }

    #[test]
    fn resolved_accesses_stay_inside_one_window(
        offset in 0u64..MODERN_BAR_SIZE + 0x100,
        size in prop::sample::select(vec![1usize, 2, 4]),
    ) {
        // Naturally aligned accesses never straddle two windows.
        let offset = offset & !(size as u64 - 1);
        match resolve(offset, size) {
            Some((region, rel)) => {
                prop_assert_eq!(region.offset() + rel, offset);
                prop_assert!(rel + size as u64 <= region.size());
            }
            None => prop_assert!(offset + size as u64 > MODERN_BAR_SIZE),
        }
    }
}
