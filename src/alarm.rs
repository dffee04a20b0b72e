//! Alarm kinds, the fixed alarm catalog and threshold evaluation.

use serde::{Serialize, Serializer};
use std::fmt;

/// One threshold condition. Wire bit values match the reporting format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmKind {
    High,
    Low,
    MaxDepth,
}

impl AlarmKind {
    /// Display order.
    pub const ALL: [AlarmKind; 3] = [AlarmKind::High, AlarmKind::Low, AlarmKind::MaxDepth];

    pub const fn bit(self) -> u8 {
        match self {
            AlarmKind::High => 0b0000_0001,
            AlarmKind::Low => 0b0000_0010,
            AlarmKind::MaxDepth => 0b0000_0100,
        }
    }
}

/// Set of active alarms. The empty set is the "clear" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AlarmSet(u8);

impl AlarmSet {
    pub const CLEAR: AlarmSet = AlarmSet(0);

    pub fn from_bits(bits: u8) -> Self {
        let mask = AlarmKind::ALL.iter().fold(0, |acc, k| acc | k.bit());
        AlarmSet(bits & mask)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_clear(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, kind: AlarmKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: AlarmKind) {
        self.0 |= kind.bit();
    }

    pub fn iter(self) -> impl Iterator<Item = AlarmKind> {
        AlarmKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<AlarmKind> for AlarmSet {
    fn from_iter<I: IntoIterator<Item = AlarmKind>>(iter: I) -> Self {
        let mut set = AlarmSet::CLEAR;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl fmt::Display for AlarmSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clear() {
            return f.write_str(ALARMS[3].name);
        }
        let mut first = true;
        for kind in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(AlarmRecord::for_kind(kind).name)?;
        }
        Ok(())
    }
}

impl Serialize for AlarmSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmRecord {
    pub alarm_type: u8,
    pub name: &'static str,
}

pub const ALARMS: [AlarmRecord; 4] = [
    AlarmRecord {
        alarm_type: AlarmKind::High.bit(),
        name: "HI",
    },
    AlarmRecord {
        alarm_type: AlarmKind::Low.bit(),
        name: "LO",
    },
    AlarmRecord {
        alarm_type: AlarmKind::MaxDepth.bit(),
        name: "MAXDEPTH",
    },
    AlarmRecord {
        alarm_type: 0,
        name: "CLEARALL",
    },
];

impl AlarmRecord {
    pub fn for_kind(kind: AlarmKind) -> &'static AlarmRecord {
        match kind {
            AlarmKind::High => &ALARMS[0],
            AlarmKind::Low => &ALARMS[1],
            AlarmKind::MaxDepth => &ALARMS[2],
        }
    }
}

/// Maps a single alarm bit value (or 0 for clear) to its catalog ordinal.
pub fn map_alarm(alarm_type: u8) -> Option<usize> {
    ALARMS.iter().position(|a| a.alarm_type == alarm_type)
}

/// Derives the alarm set for a liquid depth against frozen thresholds.
pub fn evaluate(liquid_depth: f32, lo_alarm: f32, hi_alarm: f32, max_depth: f32) -> AlarmSet {
    let mut set = AlarmSet::CLEAR;
    if liquid_depth < lo_alarm {
        set.insert(AlarmKind::Low);
    }
    if liquid_depth > hi_alarm {
        set.insert(AlarmKind::High);
    }
    if liquid_depth >= max_depth {
        set.insert(AlarmKind::MaxDepth);
    }
    set
}

/// Single-slot alarm history for one tank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmState {
    pub current: AlarmSet,
    pub previous: AlarmSet,
}

impl AlarmState {
    /// Records a fresh evaluation and reports whether it differs from the
    /// stored mask.
    pub fn update(&mut self, next: AlarmSet) -> bool {
        let changed = next != self.current;
        self.previous = self.current;
        self.current = next;
        changed
    }

    /// Sets both slots so the next evaluation compares against `set`
    /// without flagging a transition now.
    pub fn seed(&mut self, set: AlarmSet) {
        self.current = set;
        self.previous = set;
    }
}
