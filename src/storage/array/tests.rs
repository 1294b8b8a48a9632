use super::*;
use crate::primitives::alloc::{AllocOptions, Image};
use crate::types::to_tagged;
use proptest::prelude::*;
use std::sync::Arc;

fn fresh_alloc() -> SlabAlloc {
    SlabAlloc::new(
        Arc::new(Image::with_reserved_prefix(32)),
        AllocOptions {
            initial_slab_size: 1024,
            ..AllocOptions::default()
        },
    )
}

/// Freezes `array` into an immutable image and returns an allocator on top of it.
fn freeze(alloc: &SlabAlloc, array: &Array) -> (SlabAlloc, Ref) {
    let mut bytes = alloc.image().to_vec();
    let r = Ref(bytes.len() as u64);
    let node = &alloc.translate(array.node_ref())[..array.capacity()];
    bytes.extend_from_slice(node);
    let image = Arc::new(Image::from_bytes(bytes.into()));
    (SlabAlloc::new(image, AllocOptions::default()), r)
}

#[test]
fn width_grows_on_insert() {
    let mut alloc = fresh_alloc();
    let mut a = Array::create_empty(&mut alloc, NodeKind::Normal).unwrap();
    assert_eq!(a.width(), 0);
    for v in [5, 15, 10, 20] {
        let size = a.size();
        a.insert(&mut alloc, size, v).unwrap();
    }
    assert_eq!(a.to_vec(&alloc), vec![5, 15, 10, 20]);
    assert_eq!(a.get(&alloc, 1), 15);
    assert_eq!(a.width(), 8);
}

#[test]
fn erase_shifts_and_shrinks_width() {
    let mut alloc = fresh_alloc();
    let mut a =
        Array::from_values(&mut alloc, NodeKind::Normal, false, &[1, 2, 1000, 3]).unwrap();
    assert_eq!(a.width(), 16);
    a.erase(&mut alloc, 2).unwrap();
    assert_eq!(a.to_vec(&alloc), vec![1, 2, 3]);
    assert_eq!(a.width(), 2);
}

#[test]
fn set_to_same_value_does_not_copy() {
    let mut alloc = fresh_alloc();
    let a = Array::from_values(&mut alloc, NodeKind::Normal, false, &[7, 8, 9]).unwrap();
    let (mut frozen, r) = freeze(&alloc, &a);
    let mut b = Array::attach(&frozen, r);
    b.set(&mut frozen, 1, 8).unwrap();
    assert_eq!(b.node_ref(), r);
    b.set(&mut frozen, 1, 4).unwrap();
    assert_ne!(b.node_ref(), r);
    assert_eq!(b.to_vec(&frozen), vec![7, 4, 9]);
    let image = frozen.image().as_ref();
    assert_eq!(Array::attach(image, r).to_vec(image), vec![7, 8, 9]);
}

#[test]
fn negative_values_use_signed_widths() {
    let mut alloc = fresh_alloc();
    let mut a = Array::from_values(&mut alloc, NodeKind::Normal, false, &[0, 1]).unwrap();
    a.add(&mut alloc, -1).unwrap();
    assert_eq!(a.width(), 8);
    a.add(&mut alloc, i64::MIN).unwrap();
    assert_eq!(a.width(), 64);
    a.erase(&mut alloc, 3).unwrap();
    assert_eq!(a.width(), 8);
    assert_eq!(a.to_vec(&alloc), vec![0, 1, -1]);
}

#[test]
fn move_last_over_overwrites_slot() {
    let mut alloc = fresh_alloc();
    let mut a = Array::from_values(&mut alloc, NodeKind::Normal, false, &[1, 2, 3, 4]).unwrap();
    a.move_last_over(&mut alloc, 1).unwrap();
    assert_eq!(a.to_vec(&alloc), vec![1, 4, 3]);
    a.move_last_over(&mut alloc, 2).unwrap();
    assert_eq!(a.to_vec(&alloc), vec![1, 4]);
}

#[test]
fn truncate_recomputes_width() {
    let mut alloc = fresh_alloc();
    let mut a =
        Array::from_values(&mut alloc, NodeKind::Normal, false, &[1, 0, 1, 70_000]).unwrap();
    a.truncate(&mut alloc, 3).unwrap();
    assert_eq!(a.width(), 1);
    a.clear(&mut alloc).unwrap();
    assert!(a.is_empty());
    assert_eq!(a.width(), 0);
}

#[test]
fn find_respects_bounds_and_conditions() {
    let mut alloc = fresh_alloc();
    let a =
        Array::from_values(&mut alloc, NodeKind::Normal, false, &[3, 9, 3, -2, 7]).unwrap();
    assert_eq!(a.find_first::<Equal, _>(&alloc, 3, 0, 5), Some(0));
    assert_eq!(a.find_first::<Equal, _>(&alloc, 3, 1, 5), Some(2));
    assert_eq!(a.find_first::<Equal, _>(&alloc, 3, 3, 5), None);
    assert_eq!(a.find_first::<Less, _>(&alloc, 0, 0, 5), Some(3));
    assert_eq!(a.find_first::<Greater, _>(&alloc, 8, 0, 5), Some(1));
    assert_eq!(a.find_first::<NotEqual, _>(&alloc, 3, 0, 5), Some(1));
    let mut hits = Vec::new();
    a.find_all::<Equal, _>(&alloc, 3, 0, 5, 100, &mut hits);
    assert_eq!(hits, vec![100, 102]);
    assert_eq!(a.find_first::<Equal, _>(&alloc, 1 << 40, 0, 5), None);
}

#[test]
fn bounds_on_sorted_node() {
    let mut alloc = fresh_alloc();
    let a =
        Array::from_values(&mut alloc, NodeKind::Normal, false, &[1, 3, 3, 3, 8]).unwrap();
    assert_eq!(a.lower_bound(&alloc, 3), 1);
    assert_eq!(a.upper_bound(&alloc, 3), 4);
    assert_eq!(a.lower_bound(&alloc, 0), 0);
    assert_eq!(a.upper_bound(&alloc, 9), 5);
}

#[test]
fn has_refs_node_distinguishes_refs_from_tags() {
    let mut alloc = fresh_alloc();
    let child = Array::from_values(&mut alloc, NodeKind::Normal, false, &[1, 2]).unwrap();
    let parent = Array::from_values(
        &mut alloc,
        NodeKind::HasRefs,
        true,
        &[child.node_ref().to_element(), to_tagged(12), 0],
    )
    .unwrap();
    assert!(parent.has_refs());
    assert!(parent.context_flag());
    assert_eq!(parent.get_ref(&alloc, 0), Some(child.node_ref()));
    assert_eq!(parent.get_ref(&alloc, 1), None);
    assert_eq!(parent.get_ref(&alloc, 2), None);
    assert_eq!(alloc.stats().live_bytes, 32);
    parent.destroy_deep(&mut alloc);
    assert_eq!(alloc.stats().live_bytes, 0);
}

#[test]
fn adjust_ge_shifts_matching_elements() {
    let mut alloc = fresh_alloc();
    let mut a = Array::from_values(&mut alloc, NodeKind::Normal, false, &[0, 4, 2, 9]).unwrap();
    assert_eq!(a.adjust_ge(&mut alloc, 2, 10).unwrap(), 3);
    assert_eq!(a.to_vec(&alloc), vec![0, 14, 12, 19]);
    a.adjust(&mut alloc, 0, 2, -1).unwrap();
    assert_eq!(a.to_vec(&alloc), vec![-1, 13, 12, 19]);
}

#[test]
fn try_attach_rejects_bad_headers() {
    let mut alloc = fresh_alloc();
    let a = Array::from_values(&mut alloc, NodeKind::Normal, false, &[1, 2, 3]).unwrap();
    let (frozen, r) = freeze(&alloc, &a);
    let image = frozen.image().as_ref();
    assert!(Array::try_attach(image, r, image.len()).is_ok());
    assert!(Array::try_attach(image, Ref(r.0 + 4), image.len()).is_err());
    assert!(Array::try_attach(image, Ref(image.len()), image.len()).is_err());

    let mut bytes = image.to_vec();
    bytes[r.0 as usize + node::header::SIZE.start + 2] = 200;
    let broken = Image::from_bytes(bytes.into());
    assert!(matches!(
        Array::try_attach(&broken, r, broken.len()),
        Err(StoreError::InvalidDatabase(_))
    ));
}

proptest! {
    #[test]
    fn width_is_always_minimal(ops in prop::collection::vec((0u8..4, any::<i64>(), 0usize..64), 1..80)) {
        let mut alloc = fresh_alloc();
        let mut a = Array::create_empty(&mut alloc, NodeKind::Normal).unwrap();
        let mut model: Vec<i64> = Vec::new();
        for (op, raw, pos) in ops {
            let value = raw >> (raw.rem_euclid(64) as u32);
            match op {
                0 => {
                    let ndx = pos % (model.len() + 1);
                    a.insert(&mut alloc, ndx, value).unwrap();
                    model.insert(ndx, value);
                }
                1 if !model.is_empty() => {
                    let ndx = pos % model.len();
                    a.set(&mut alloc, ndx, value).unwrap();
                    model[ndx] = value;
                }
                2 if !model.is_empty() => {
                    let ndx = pos % model.len();
                    a.erase(&mut alloc, ndx).unwrap();
                    model.remove(ndx);
                }
                3 if !model.is_empty() => {
                    let ndx = pos % model.len();
                    a.move_last_over(&mut alloc, ndx).unwrap();
                    model.swap_remove(ndx);
                }
                _ => {}
            }
            prop_assert_eq!(a.to_vec(&alloc), model.clone());
            prop_assert_eq!(a.width(), min_width(&model));
        }
    }
}
