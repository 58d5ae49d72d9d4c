//! Level touch detector.
//!
//! Tracks, per instrument and level, which side of the level's tolerance band
//! the last sample was on, and reports a touch when price moves into the band
//! from the side that makes the touch meaningful.

use cpr_core::{InstrumentId, LevelKind, PriceSample, SessionLevels, Side, TouchEvent};
use dashmap::DashMap;
use tracing::{debug, info};

/// Inclusive price band around a level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToleranceBand {
    pub lower: f64,
    pub upper: f64,
}

impl ToleranceBand {
    /// Band of `level * (1 ± tolerance)`. `tolerance` is a fraction (0.0005 = 0.05%).
    pub fn around(level: f64, tolerance: f64) -> Self {
        Self {
            lower: level * (1.0 - tolerance),
            upper: level * (1.0 + tolerance),
        }
    }

    #[inline]
    pub fn contains(&self, price: f64) -> bool {
        price >= self.lower && price <= self.upper
    }

    #[inline]
    pub fn classify(&self, price: f64) -> Side {
        if price > self.upper {
            Side::Above
        } else if price < self.lower {
            Side::Below
        } else {
            Side::InsideBand
        }
    }
}

/// Whether entering the band from `from` counts as a touch of `kind`.
///
/// Resistance is approached from below, support from above, the pivot from
/// either side.
pub fn is_valid_approach(kind: LevelKind, from: Side) -> bool {
    match kind {
        LevelKind::R1 => from == Side::Below,
        LevelKind::S1 => from == Side::Above,
        LevelKind::Pivot => matches!(from, Side::Above | Side::Below),
    }
}

/// Side tracking for one level of one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelState {
    pub kind: LevelKind,
    pub level: f64,
    pub band: ToleranceBand,
    pub last_side: Side,
}

impl LevelState {
    pub fn new(kind: LevelKind, level: f64, tolerance: f64) -> Self {
        Self {
            kind,
            level,
            band: ToleranceBand::around(level, tolerance),
            last_side: Side::Unknown,
        }
    }

    /// Record a price. Returns the side the price came from when it is a touch.
    ///
    /// State is updated on every sample, so a price that stays inside the
    /// band never fires twice and leaving the band re-arms the level.
    pub fn observe(&mut self, price: f64) -> Option<Side> {
        let previous = self.last_side;
        let current = self.band.classify(price);
        self.last_side = current;

        (current == Side::InsideBand && is_valid_approach(self.kind, previous)).then_some(previous)
    }

    pub fn reset(&mut self) {
        self.last_side = Side::Unknown;
    }
}

#[derive(Debug, Clone)]
struct TrackedInstrument {
    session: SessionLevels,
    states: Vec<LevelState>,
}

impl TrackedInstrument {
    fn new(session: SessionLevels, tolerance: f64) -> Self {
        let states = LevelKind::ALL
            .iter()
            .map(|kind| LevelState::new(*kind, session.level(*kind), tolerance))
            .collect();
        Self { session, states }
    }
}

/// Touch detector for all instruments.
///
/// Each instrument's state lives in its own map entry, so samples for
/// different instruments never contend.
#[derive(Debug)]
pub struct TouchDetector {
    tolerance: f64,
    instruments: DashMap<InstrumentId, TrackedInstrument>,
}

impl TouchDetector {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            instruments: DashMap::new(),
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Install the day's levels for an instrument. All sides start `Unknown`.
    pub fn load_levels(&self, session: SessionLevels) {
        debug!(
            instrument = %session.instrument,
            pivot = session.levels.pivot,
            r1 = session.levels.r1,
            s1 = session.levels.s1,
            "Loaded levels"
        );
        self.instruments
            .insert(session.instrument.clone(), TrackedInstrument::new(session, self.tolerance));
    }

    /// Forget the side of every level, keeping the levels themselves.
    pub fn reset_all(&self) {
        for mut entry in self.instruments.iter_mut() {
            entry.states.iter_mut().for_each(LevelState::reset);
        }
    }

    /// Drop all levels.
    pub fn clear(&self) {
        self.instruments.clear();
    }

    pub fn tracked_count(&self) -> usize {
        self.instruments.len()
    }

    pub fn levels_for(&self, instrument: &InstrumentId) -> Option<SessionLevels> {
        self.instruments.get(instrument).map(|t| t.session.clone())
    }

    pub fn side_of(&self, instrument: &InstrumentId, kind: LevelKind) -> Option<Side> {
        self.instruments.get(instrument).and_then(|t| {
            t.states
                .iter()
                .find(|s| s.kind == kind)
                .map(|s| s.last_side)
        })
    }

    /// Feed a sample and return the touches it produced, highest priority first.
    pub fn on_sample(&self, sample: &PriceSample) -> Vec<TouchEvent> {
        if !sample.is_valid() {
            debug!(instrument = %sample.instrument, price = sample.price, "Ignoring invalid price");
            return Vec::new();
        }

        let Some(mut tracked) = self.instruments.get_mut(&sample.instrument) else {
            debug!(instrument = %sample.instrument, "No levels loaded, ignoring sample");
            return Vec::new();
        };

        let mut events: Vec<TouchEvent> = tracked
            .states
            .iter_mut()
            .filter_map(|state| {
                state.observe(sample.price).map(|from_side| TouchEvent {
                    instrument: sample.instrument.clone(),
                    level: state.kind,
                    level_value: state.level,
                    price: sample.price,
                    timestamp: sample.observed_at,
                    from_side,
                })
            })
            .collect();

        events.sort_by(|a, b| b.level.priority().cmp(&a.level.priority()));
        for event in &events {
            info!(
                instrument = %event.instrument,
                level = %event.level,
                level_value = event.level_value,
                price = event.price,
                from = %event.from_side,
                "Level touched"
            );
        }
        events
    }
}

/// Split simultaneous touches into the one to alert and the others.
pub fn most_significant(mut events: Vec<TouchEvent>) -> Option<(TouchEvent, Vec<LevelKind>)> {
    if events.is_empty() {
        return None;
    }
    events.sort_by(|a, b| b.level.priority().cmp(&a.level.priority()));
    let primary = events.remove(0);
    let others = events.into_iter().map(|e| e.level).collect();
    Some((primary, others))
}
