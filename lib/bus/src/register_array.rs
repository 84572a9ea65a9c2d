// Licensed under the Apache-2.0 license

use crate::Register;

/// Geometry of a register array field, used by #[derive(Bus)] to compute
/// the address range a `#[register_array]` field occupies.
pub trait RegisterArray {
    const ITEM_SIZE: usize;
    const LEN: usize;
}

impl<const LEN: usize, T: Register> RegisterArray for [T; LEN] {
    const ITEM_SIZE: usize = T::SIZE;
    const LEN: usize = LEN;
}
