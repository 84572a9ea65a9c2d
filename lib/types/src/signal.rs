/*++

Licensed under the Apache-2.0 license.

File Name:

    signal.rs

Abstract:

    File contains the tri-state signal level used by multi-driver wires.

--*/

use std::fmt;
use std::str::FromStr;

/// A single driver level on a shared wire.
///
/// The value packs `{active, strength, level}` bits under a fixed tag so that
/// a clobbered signal (e.g. read out of a stale buffer) is detectable instead
/// of silently driving the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal(u8);

const TAG: u8 = 0b1011_0000;
const TAG_MASK: u8 = 0b1111_1000;
const FLAG_ACTIVE: u8 = 0b100;
const FLAG_STRONG: u8 = 0b010;
const FLAG_HIGH: u8 = 0b001;

impl Signal {
    /// A strongly driven level
    pub fn strong(high: bool) -> Signal {
        Signal(TAG | FLAG_ACTIVE | FLAG_STRONG | if high { FLAG_HIGH } else { 0 })
    }

    /// A weakly driven (pull) level
    pub fn weak(high: bool) -> Signal {
        Signal(TAG | FLAG_ACTIVE | if high { FLAG_HIGH } else { 0 })
    }

    /// An undriven (Hi-Z) level
    pub fn hi_z() -> Signal {
        Signal(TAG)
    }

    /// Returns `false` if the tag bits have been clobbered
    pub fn is_valid(&self) -> bool {
        self.0 & TAG_MASK == TAG
    }

    pub fn is_hi_z(&self) -> bool {
        self.is_valid() && self.0 & FLAG_ACTIVE == 0
    }

    pub fn is_strong(&self) -> bool {
        self.is_valid() && self.0 & (FLAG_ACTIVE | FLAG_STRONG) == (FLAG_ACTIVE | FLAG_STRONG)
    }

    /// The driven level, or `None` for Hi-Z or a corrupt signal
    pub fn level(&self) -> Option<bool> {
        if self.is_valid() && self.0 & FLAG_ACTIVE != 0 {
            Some(self.0 & FLAG_HIGH != 0)
        } else {
            None
        }
    }

    /// Resolves the wire level from all of its drivers.
    ///
    /// Hi-Z drivers are skipped; the first live driver seeds the result; a
    /// strong driver overrides any weak one. Opposing drivers of equal
    /// strength keep the later value and log the conflict.
    pub fn combine(signals: &[Signal]) -> Signal {
        let mut result = Signal::hi_z();
        for (idx, sig) in signals.iter().enumerate() {
            if !sig.is_valid() {
                log::error!("combine: driver {idx} failed the tag check (0x{:02x})", sig.0);
                continue;
            }
            if sig.is_hi_z() {
                continue;
            }
            if result.is_hi_z() {
                result = *sig;
                continue;
            }
            match (result.is_strong(), sig.is_strong()) {
                (true, false) => {}
                (false, true) => result = *sig,
                (strong, _) => {
                    if result.level() != sig.level() {
                        log::warn!(
                            "combine: conflicting {} drivers ({} vs {})",
                            if strong { "strong" } else { "weak" },
                            result,
                            sig
                        );
                    }
                    result = *sig;
                }
            }
        }
        result
    }

    /// One-character debug rendering
    pub fn repr(&self) -> char {
        if !self.is_valid() {
            return 'X';
        }
        match (self.is_hi_z(), self.is_strong(), self.0 & FLAG_HIGH != 0) {
            (true, _, _) => 'z',
            (false, true, true) => 'H',
            (false, true, false) => 'L',
            (false, false, true) => 'h',
            (false, false, false) => 'l',
        }
    }

    #[cfg(test)]
    fn corrupt() -> Signal {
        Signal(0x3f)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.repr())
    }
}

/// Error for signal strings that name no known level
#[derive(Debug, PartialEq, Eq)]
pub struct ParseSignalError;

impl fmt::Display for ParseSignalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unrecognized signal level")
    }
}

impl FromStr for Signal {
    type Err = ParseSignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" | "hi" | "on" | "1" => Ok(Signal::strong(true)),
            "low" | "lo" | "off" | "0" => Ok(Signal::strong(false)),
            "pu" | "pullup" => Ok(Signal::weak(true)),
            "pd" | "pulldown" => Ok(Signal::weak(false)),
            "hiz" | "z" => Ok(Signal::hi_z()),
            _ => Err(ParseSignalError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hi_z_yields_other_driver() {
        let out = Signal::combine(&[Signal::hi_z(), Signal::weak(true), Signal::hi_z()]);
        assert_eq!(out, Signal::weak(true));
        assert_eq!(Signal::combine(&[Signal::hi_z(), Signal::hi_z()]), Signal::hi_z());
        assert_eq!(Signal::combine(&[]), Signal::hi_z());
    }

    #[test]
    fn test_identical_weak_drivers() {
        let out = Signal::combine(&[Signal::weak(false), Signal::weak(false)]);
        assert_eq!(out, Signal::weak(false));
    }

    #[test]
    fn test_strong_overrides_weak() {
        let out = Signal::combine(&[Signal::weak(true), Signal::strong(false)]);
        assert_eq!(out, Signal::strong(false));
        let out = Signal::combine(&[Signal::strong(false), Signal::weak(true)]);
        assert_eq!(out, Signal::strong(false));
    }

    #[test]
    fn test_strong_conflict_keeps_last() {
        let out = Signal::combine(&[Signal::strong(true), Signal::strong(false)]);
        assert_eq!(out, Signal::strong(false));
    }

    #[test]
    fn test_corrupt_driver_is_skipped() {
        assert!(!Signal::corrupt().is_valid());
        assert_eq!(Signal::corrupt().repr(), 'X');
        let out = Signal::combine(&[Signal::corrupt(), Signal::weak(true)]);
        assert_eq!(out, Signal::weak(true));
    }

    #[test]
    fn test_parse() {
        assert_eq!("1".parse(), Ok(Signal::strong(true)));
        assert_eq!("OFF".parse(), Ok(Signal::strong(false)));
        assert_eq!("pullup".parse(), Ok(Signal::weak(true)));
        assert_eq!("pd".parse(), Ok(Signal::weak(false)));
        assert_eq!("hiz".parse(), Ok(Signal::hi_z()));
        assert_eq!("pull".parse::<Signal>(), Err(ParseSignalError));
    }

    #[test]
    fn test_repr() {
        assert_eq!(Signal::strong(true).repr(), 'H');
        assert_eq!(Signal::strong(false).repr(), 'L');
        assert_eq!(Signal::weak(true).repr(), 'h');
        assert_eq!(Signal::weak(false).repr(), 'l');
        assert_eq!(Signal::hi_z().repr(), 'z');
    }
}
