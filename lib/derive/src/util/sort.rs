/*++

Licensed under the Apache-2.0 license.

File Name:

    sort.rs

Abstract:

    Helper for iterating a collection in key order.

--*/

pub fn sorted_by_key<K: Ord, T>(
    iter: impl Iterator<Item = T>,
    key: impl FnMut(&T) -> K,
) -> impl DoubleEndedIterator<Item = T> {
    let mut items: Vec<T> = iter.collect();
    items.sort_by_key(key);
    items.into_iter()
}
