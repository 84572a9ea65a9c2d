// Licensed under the Apache-2.0 license

pub mod literal;
pub mod sort;
pub mod token_iter;
