/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the JTAG debug transport library.

--*/

mod dm;
mod dtm;
mod tap;

pub use crate::dm::{CmdErr, DebugHart, Dm, DATA_COUNT, DEBUG_MEM_SIZE, PROGBUF_SIZE};
pub use crate::dtm::{DebugDevice, Dtm, IR_DMI, IR_DTMCS};
pub use crate::tap::{idcode, JtagTap, TapDataHandler, TapState, MAX_IR_LENGTH};
