/*++

Licensed under the Apache-2.0 license.

File Name:

    dynamic_bus.rs

Abstract:

    File contains DynamicBus type.

--*/

use std::io::ErrorKind;
use std::ops::RangeInclusive;

use crate::{Bus, BusError};
use ot_emu_types::{RvAddr, RvData, RvSize};

struct MappedDevice {
    name: String,
    mmap_range: RangeInclusive<RvAddr>,
    bus: Box<dyn Bus>,
}

/// A bus assembled at runtime from boxed devices. The device list is kept
/// sorted by start address; lookups binary-search it.
pub struct DynamicBus {
    devs: Vec<MappedDevice>,
}

impl Default for DynamicBus {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicBus {
    pub fn new() -> DynamicBus {
        Self { devs: Vec::new() }
    }

    /// Map `bus` at `mmap_range`. `name` is only used in collision
    /// diagnostics. Fails with `ErrorKind::AddrInUse` if the range
    /// overlaps an already-attached device.
    pub fn attach_dev(
        &mut self,
        name: &str,
        mmap_range: RangeInclusive<RvAddr>,
        bus: Box<dyn Bus>,
    ) -> std::io::Result<()> {
        let index = self
            .devs
            .partition_point(|d| d.mmap_range.start() < mmap_range.start());
        let collision = self.devs[..index]
            .last()
            .filter(|d| d.mmap_range.end() >= mmap_range.start())
            .or_else(|| {
                self.devs[index..]
                    .first()
                    .filter(|d| d.mmap_range.start() <= mmap_range.end())
            });
        if let Some(other) = collision {
            return Err(std::io::Error::new(
                ErrorKind::AddrInUse,
                format!(
                    "device {name} at {:#010x}..={:#010x} overlaps device {} at {:#010x}..={:#010x}",
                    mmap_range.start(),
                    mmap_range.end(),
                    other.name,
                    other.mmap_range.start(),
                    other.mmap_range.end()
                ),
            ));
        }
        self.devs.insert(
            index,
            MappedDevice {
                name: name.into(),
                mmap_range,
                bus,
            },
        );
        Ok(())
    }

    fn dev_at(&mut self, addr: RvAddr) -> Option<&mut MappedDevice> {
        let index = self
            .devs
            .partition_point(|d| *d.mmap_range.start() <= addr)
            .checked_sub(1)?;
        let dev = &mut self.devs[index];
        if dev.mmap_range.contains(&addr) {
            Some(dev)
        } else {
            None
        }
    }
}

impl Bus for DynamicBus {
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
        match self.dev_at(addr) {
            Some(dev) => dev.bus.read(size, addr - dev.mmap_range.start()),
            None => Err(BusError::LoadAccessFault),
        }
    }

    fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), BusError> {
        match self.dev_at(addr) {
            Some(dev) => dev.bus.write(size, addr - dev.mmap_range.start(), val),
            None => Err(BusError::StoreAccessFault),
        }
    }

    fn poll(&mut self) {
        for dev in self.devs.iter_mut() {
            dev.bus.poll();
        }
    }

    fn warm_reset(&mut self) {
        for dev in self.devs.iter_mut() {
            dev.bus.warm_reset();
        }
    }

    fn update_reset(&mut self) {
        for dev in self.devs.iter_mut() {
            dev.bus.update_reset();
        }
    }
}
