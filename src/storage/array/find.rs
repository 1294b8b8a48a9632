//! Search conditions for leaf scans.

/// A predicate `element <op> target` usable by `find_first`/`find_all`.
pub trait Condition {
    /// Evaluates the predicate for one element.
    fn eval(element: i64, target: i64) -> bool;

    /// Whether any element in `lo..=hi` could satisfy the predicate.
    ///
    /// Lets a scan skip a whole node when the target is outside the range
    /// its width can store.
    fn may_match(target: i64, lo: i64, hi: i64) -> bool;
}

/// `element == target`
pub struct Equal;
/// `element != target`
pub struct NotEqual;
/// `element < target`
pub struct Less;
/// `element > target`
pub struct Greater;

impl Condition for Equal {
    fn eval(element: i64, target: i64) -> bool {
        element == target
    }

    fn may_match(target: i64, lo: i64, hi: i64) -> bool {
        lo <= target && target <= hi
    }
}

impl Condition for NotEqual {
    fn eval(element: i64, target: i64) -> bool {
        element != target
    }

    fn may_match(target: i64, lo: i64, hi: i64) -> bool {
        !(lo == hi && lo == target)
    }
}

impl Condition for Less {
    fn eval(element: i64, target: i64) -> bool {
        element < target
    }

    fn may_match(target: i64, lo: i64, _hi: i64) -> bool {
        lo < target
    }
}

impl Condition for Greater {
    fn eval(element: i64, target: i64) -> bool {
        element > target
    }

    fn may_match(target: i64, _lo: i64, hi: i64) -> bool {
        hi > target
    }
}
