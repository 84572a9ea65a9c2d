/*++

Licensed under the Apache-2.0 license.

File Name:

    register.rs

Abstract:

    File contains the Register trait and the MMIO register wrappers used
    by peripheral implementations.

--*/

use crate::BusError;
use ot_emu_types::{RvData, RvSize};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::InMemoryRegister;
use tock_registers::{LocalRegisterCopy, RegisterLongName, UIntLike};

/// A memory-mapped register. Accesses narrower or wider than the
/// register fault, matching what the bus fabric would do.
pub trait Register {
    /// Width of the register in bytes.
    const SIZE: usize;

    fn read(&self, size: RvSize) -> Result<RvData, BusError>;

    fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError>;
}

macro_rules! impl_register_for_uint {
    ($type:ty, $size:path) => {
        impl Register for $type {
            const SIZE: usize = std::mem::size_of::<Self>();

            fn read(&self, size: RvSize) -> Result<RvData, BusError> {
                match size {
                    $size => Ok(RvData::from(*self)),
                    _ => Err(BusError::LoadAccessFault),
                }
            }

            fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
                match size {
                    $size => {
                        *self = val as $type;
                        Ok(())
                    }
                    _ => Err(BusError::StoreAccessFault),
                }
            }
        }
    };
}

impl_register_for_uint!(u8, RvSize::Byte);
impl_register_for_uint!(u16, RvSize::HalfWord);
impl_register_for_uint!(u32, RvSize::Word);

impl<T: UIntLike + Register, R: RegisterLongName> Register for LocalRegisterCopy<T, R> {
    const SIZE: usize = T::SIZE;

    fn read(&self, size: RvSize) -> Result<RvData, BusError> {
        Register::read(&self.get(), size)
    }

    fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        let mut raw = T::zero();
        Register::write(&mut raw, size, val)?;
        self.set(raw);
        Ok(())
    }
}

macro_rules! register_wrapper {
    ($(#[$doc:meta])* $name:ident, readable: $readable:tt, writable: $writable:tt) => {
        $(#[$doc])*
        pub struct $name<T: UIntLike, R: RegisterLongName = ()> {
            pub reg: InMemoryRegister<T, R>,
        }

        impl<T: UIntLike, R: RegisterLongName> $name<T, R> {
            pub fn new(val: T) -> Self {
                Self {
                    reg: InMemoryRegister::new(val),
                }
            }
        }

        impl<T: UIntLike + Register, R: RegisterLongName> Register for $name<T, R> {
            const SIZE: usize = std::mem::size_of::<T>();

            register_wrapper!(@read $readable);
            register_wrapper!(@write $writable);
        }
    };
    (@read true) => {
        fn read(&self, size: RvSize) -> Result<RvData, BusError> {
            if usize::from(size) != std::mem::size_of::<T>() {
                return Err(BusError::LoadAccessFault);
            }
            Register::read(&self.reg.get(), size)
        }
    };
    (@read false) => {
        fn read(&self, _size: RvSize) -> Result<RvData, BusError> {
            Err(BusError::LoadAccessFault)
        }
    };
    (@write true) => {
        fn write(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
            if usize::from(size) != std::mem::size_of::<T>() {
                return Err(BusError::StoreAccessFault);
            }
            let mut raw = T::zero();
            Register::write(&mut raw, size, val)?;
            self.reg.set(raw);
            Ok(())
        }
    };
    (@write false) => {
        fn write(&mut self, _size: RvSize, _val: RvData) -> Result<(), BusError> {
            Err(BusError::StoreAccessFault)
        }
    };
}

register_wrapper!(
    /// Register readable and writable by the guest.
    ReadWriteRegister,
    readable: true,
    writable: true
);

register_wrapper!(
    /// Register the guest can read but not write; writes fault.
    ReadOnlyRegister,
    readable: true,
    writable: false
);

register_wrapper!(
    /// Register the guest can write but not read; reads fault.
    WriteOnlyRegister,
    readable: false,
    writable: true
);
