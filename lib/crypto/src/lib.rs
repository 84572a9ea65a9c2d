/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the emulator crypto library.

--*/

mod helpers;
mod present;
mod prince;
mod secded;
mod sha3;
mod subst_perm;

pub use crate::helpers::EndianessTransform;
pub use crate::present::Present;
pub use crate::prince::prince_run;
pub use crate::secded::{secded_39_32_dec, secded_39_32_enc, EccError};
pub use crate::sha3::{Sha3, Sha3Mode, Sha3Strength, KECCAK_STATE_SIZE};
pub use crate::subst_perm::{subst_perm_dec, subst_perm_enc};
