use crate::config::ConfigError;
use heapless::Vec;

/// Upper bound of each of the two poll lists
pub const MAX_POLL_REGISTERS: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterWidth {
    /// 8-bit register value
    Narrow,
    /// 16-bit register value
    Wide,
}

/// The register to poll at a given cursor position
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PollEntry {
    pub address: u8,
    pub width: RegisterWidth,
    /// Set on the final entry of a pass
    pub is_last: bool,
}

/// Position within a poll pass
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PollCursor(usize);

impl PollCursor {
    pub const START: PollCursor = PollCursor(0);

    pub fn next(self) -> Self {
        PollCursor(self.0 + 1)
    }
}

/// Ordered register poll sequence
///
/// A pass reads every narrow register in list order, then every wide register in list order,
/// each exactly once. The values read during passes are kept for the caller.
#[derive(Debug, Clone)]
pub struct RegisterPoll {
    narrow: Vec<u8, MAX_POLL_REGISTERS>,
    wide: Vec<u8, MAX_POLL_REGISTERS>,
    values: [Option<u32>; MAX_POLL_REGISTERS * 2],
}

impl RegisterPoll {
    pub fn new(narrow: &[u8], wide: &[u8]) -> Result<Self, ConfigError> {
        Ok(Self {
            narrow: Vec::from_slice(narrow).map_err(|_| ConfigError::TooManyRegisters)?,
            wide: Vec::from_slice(wide).map_err(|_| ConfigError::TooManyRegisters)?,
            values: [None; MAX_POLL_REGISTERS * 2],
        })
    }

    /// Number of reads in one pass
    pub fn len(&self) -> usize {
        self.narrow.len() + self.wide.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The register to read at `cursor`, `None` once the pass is complete
    pub fn entry(&self, cursor: PollCursor) -> Option<PollEntry> {
        let idx = cursor.0;
        let is_last = idx + 1 == self.len();
        if let Some(address) = self.narrow.get(idx) {
            return Some(PollEntry {
                address: *address,
                width: RegisterWidth::Narrow,
                is_last,
            });
        }
        self.wide
            .get(idx - self.narrow.len())
            .map(|address| PollEntry {
                address: *address,
                width: RegisterWidth::Wide,
                is_last,
            })
    }

    /// Stores the value read at `cursor`
    pub fn record(&mut self, cursor: PollCursor, value: u32) {
        if let Some(entry) = self.entry(cursor) {
            let value = match entry.width {
                RegisterWidth::Narrow => value & 0xFF,
                RegisterWidth::Wide => value & 0xFFFF,
            };
            self.values[cursor.0] = Some(value);
        }
    }

    /// Last polled value of a register, if it has been read yet
    pub fn value(&self, width: RegisterWidth, address: u8) -> Option<u32> {
        let (list, offset) = match width {
            RegisterWidth::Narrow => (&self.narrow, 0),
            RegisterWidth::Wide => (&self.wide, self.narrow.len()),
        };
        list.iter()
            .position(|a| *a == address)
            .and_then(|idx| self.values[idx + offset])
    }

    /// Narrow list in poll order
    pub fn narrow(&self) -> &[u8] {
        &self.narrow
    }

    /// Wide list in poll order
    pub fn wide(&self) -> &[u8] {
        &self.wide
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(poll: &RegisterPoll) -> std::vec::Vec<PollEntry> {
        let mut cursor = PollCursor::START;
        let mut out = std::vec::Vec::new();
        while let Some(entry) = poll.entry(cursor) {
            out.push(entry);
            cursor = cursor.next();
        }
        out
    }

    #[test]
    fn narrow_first_then_wide_in_order() {
        let poll = RegisterPoll::new(&[0x08, 0x1b, 0x1c], &[0x04, 0x1a]).unwrap();
        let entries = walk(&poll);
        let addresses: std::vec::Vec<_> = entries.iter().map(|e| (e.address, e.width)).collect();
        assert_eq!(
            addresses,
            [
                (0x08, RegisterWidth::Narrow),
                (0x1b, RegisterWidth::Narrow),
                (0x1c, RegisterWidth::Narrow),
                (0x04, RegisterWidth::Wide),
                (0x1a, RegisterWidth::Wide),
            ]
        );
        let last: std::vec::Vec<_> = entries.iter().map(|e| e.is_last).collect();
        assert_eq!(last, [false, false, false, false, true]);
    }

    #[test]
    fn last_flag_without_wide_registers() {
        let poll = RegisterPoll::new(&[1, 2], &[]).unwrap();
        let entries = walk(&poll);
        assert_eq!(entries.len(), 2);
        assert!(entries[1].is_last);
        assert_eq!(entries[1].width, RegisterWidth::Narrow);
    }

    #[test]
    fn empty_poll_has_no_entries() {
        let poll = RegisterPoll::new(&[], &[]).unwrap();
        assert!(poll.is_empty());
        assert_eq!(poll.entry(PollCursor::START), None);
    }

    #[test]
    fn too_many_registers() {
        let many = [0u8; MAX_POLL_REGISTERS + 1];
        assert_eq!(
            RegisterPoll::new(&many, &[]).unwrap_err(),
            ConfigError::TooManyRegisters
        );
    }

    #[test]
    fn records_values_by_width() {
        let mut poll = RegisterPoll::new(&[0x08], &[0x08]).unwrap();
        assert_eq!(poll.value(RegisterWidth::Narrow, 0x08), None);
        poll.record(PollCursor::START, 0x1ff);
        poll.record(PollCursor::START.next(), 0x12345);
        assert_eq!(poll.value(RegisterWidth::Narrow, 0x08), Some(0xff));
        assert_eq!(poll.value(RegisterWidth::Wide, 0x08), Some(0x2345));
        assert_eq!(poll.value(RegisterWidth::Wide, 0x09), None);
    }
}
