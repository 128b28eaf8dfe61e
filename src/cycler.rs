//! Wrap-around stepping through the filter ring `[defaults..., users...]`.

use crate::filters::{FilterCatalog, FilterSpec};

/// Returns the ring index reached by moving `offset` steps from `current`.
///
/// A `current` of `None` (the filter is in neither list, e.g. it was deleted)
/// starts from the boundary between the default and the user filters.
/// Returns `None` only for an empty ring.
pub fn cycle_index(
    default_count: usize,
    user_count: usize,
    current: Option<usize>,
    offset: isize,
) -> Option<usize> {
    let len = default_count + user_count;
    if len == 0 {
        return None;
    }

    let start = current.filter(|&i| i < len).unwrap_or(default_count) as i128;
    let next = (start + offset as i128).rem_euclid(len as i128);
    Some(next as usize)
}

/// Filter reached from `current` after `offset` steps.
pub fn cycle(catalog: &FilterCatalog, current: &FilterSpec, offset: isize) -> Option<FilterSpec> {
    let index = cycle_index(
        catalog.defaults().len(),
        catalog.users().len(),
        catalog.position(current),
        offset,
    )?;
    catalog.get(index).cloned()
}
