/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the emulator peripheral library.

--*/

mod kmac;
mod rom_ctrl;
mod rom_image;

pub use crate::kmac::{AppCfg, AppRequest, AppResponse, Kmac, KmacAppPorts, APP_DIGEST_SIZE};
pub use crate::rom_ctrl::{RomCtrl, RomMem, RomRegion};
pub use crate::rom_image::{scramble_image, RomImage, ScrambleParams};
