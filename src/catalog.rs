//! Static catalog of the 31 measurements tracked by the dashboard.
//!
//! Order is significant: every per-feature array in the crate is indexed by
//! `id - 1`, and the upstream sends its feature list in this same order.

use serde::Serialize;

pub const FEATURE_COUNT: usize = 31;

/// Feature id of the cutterhead torque reading, used to infer machine activity.
pub const CUTTERHEAD_TORQUE_ID: u16 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Unit {
    #[serde(rename = "MPa")]
    Mpa,
    #[serde(rename = "mm/min")]
    MmPerMin,
    #[serde(rename = "kN")]
    Kn,
    #[serde(rename = "mm")]
    Mm,
    #[serde(rename = "r/min")]
    RevPerMin,
    #[serde(rename = "kN·m")]
    KnM,
    #[serde(rename = "%")]
    Percent,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Mpa => "MPa",
            Unit::MmPerMin => "mm/min",
            Unit::Kn => "kN",
            Unit::Mm => "mm",
            Unit::RevPerMin => "r/min",
            Unit::KnM => "kN·m",
            Unit::Percent => "%",
        }
    }

    /// Typical reading for the unit, where a synthetic series starts when no
    /// reading has been seen yet.
    pub fn default_value(&self) -> f64 {
        match self {
            Unit::Mpa => 10.0,
            Unit::MmPerMin => 50.0,
            Unit::Kn => 10_000.0,
            Unit::Mm => 1_000.0,
            Unit::RevPerMin => 1.5,
            Unit::KnM => 3_000.0,
            Unit::Percent => 50.0,
        }
    }
}

/// Value ranges for one feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Band {
    /// Inclusive range outside of which a reading is flagged as implausible.
    pub plausible: (f64, f64),
    /// Range a synthetic reading is expected to stay in.
    pub synthetic: (f64, f64),
}

const THRUST_PRESSURE: Band = Band { plausible: (0.1, 5.0), synthetic: (0.5, 3.0) };
const EARTH_PRESSURE: Band = Band { plausible: (0.01, 2.0), synthetic: (0.1, 0.8) };
const JACK_SPEED: Band = Band { plausible: (0.0, 100.0), synthetic: (10.0, 50.0) };
const THRUST_FORCE: Band = Band { plausible: (1_000.0, 20_000.0), synthetic: (5_000.0, 15_000.0) };
const JACK_STROKE: Band = Band { plausible: (0.0, 3_000.0), synthetic: (100.0, 1_500.0) };
const ADVANCE_SPEED: Band = Band { plausible: (0.0, 100.0), synthetic: (5.0, 30.0) };
const CUTTER_SPEED: Band = Band { plausible: (0.0, 5.0), synthetic: (0.5, 2.5) };
const CUTTER_TORQUE: Band = Band { plausible: (0.0, 10_000.0), synthetic: (1_000.0, 5_000.0) };
const MOTOR_LOAD: Band = Band { plausible: (0.0, 100.0), synthetic: (20.0, 80.0) };

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureDescriptor {
    pub id: u16,
    pub name: &'static str,
    pub unit: Unit,
    pub band: Band,
}

impl FeatureDescriptor {
    pub fn index(&self) -> usize {
        usize::from(self.id) - 1
    }

    pub fn is_plausible(&self, value: f64) -> bool {
        let (low, high) = self.band.plausible;
        value >= low && value <= high
    }

    /// Starting point of a synthetic series: the unit default, pulled into
    /// this feature's synthetic range.
    pub fn seed_value(&self) -> f64 {
        let (low, high) = self.band.synthetic;
        self.unit.default_value().clamp(low, high)
    }
}

const fn feature(id: u16, name: &'static str, unit: Unit, band: Band) -> FeatureDescriptor {
    FeatureDescriptor { id, name, unit, band }
}

pub static FEATURES: [FeatureDescriptor; FEATURE_COUNT] = [
    feature(1, "Penetration", Unit::Mpa, THRUST_PRESSURE),
    feature(2, "Thrust zone pressure (top)", Unit::Mpa, THRUST_PRESSURE),
    feature(3, "Thrust zone pressure (right)", Unit::Mpa, THRUST_PRESSURE),
    feature(4, "Thrust zone pressure (bottom)", Unit::Mpa, THRUST_PRESSURE),
    feature(5, "Thrust zone pressure (left)", Unit::Mpa, THRUST_PRESSURE),
    feature(6, "Chamber earth pressure (right)", Unit::Mpa, EARTH_PRESSURE),
    feature(7, "Chamber earth pressure (lower right)", Unit::Mpa, EARTH_PRESSURE),
    feature(8, "Chamber earth pressure (left)", Unit::Mpa, EARTH_PRESSURE),
    feature(9, "Chamber earth pressure (lower left)", Unit::Mpa, EARTH_PRESSURE),
    feature(10, "No.16 thrust jack speed", Unit::MmPerMin, JACK_SPEED),
    feature(11, "No.4 thrust jack speed", Unit::MmPerMin, JACK_SPEED),
    feature(12, "No.8 thrust jack speed", Unit::MmPerMin, JACK_SPEED),
    feature(13, "No.12 thrust jack speed", Unit::MmPerMin, JACK_SPEED),
    feature(14, "Total thrust cylinder force", Unit::Kn, THRUST_FORCE),
    feature(15, "No.16 thrust jack stroke", Unit::Mm, JACK_STROKE),
    feature(16, "No.4 thrust jack stroke", Unit::Mm, JACK_STROKE),
    feature(17, "No.8 thrust jack stroke", Unit::Mm, JACK_STROKE),
    feature(18, "No.12 thrust jack stroke", Unit::Mm, JACK_STROKE),
    feature(19, "Mean advance speed", Unit::MmPerMin, ADVANCE_SPEED),
    feature(20, "Cutterhead speed", Unit::RevPerMin, CUTTER_SPEED),
    feature(21, "Cutterhead torque", Unit::KnM, CUTTER_TORQUE),
    feature(22, "No.1 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
    feature(23, "No.2 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
    feature(24, "No.3 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
    feature(25, "No.4 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
    feature(26, "No.5 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
    feature(27, "No.6 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
    feature(28, "No.7 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
    feature(29, "No.8 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
    feature(30, "No.9 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
    feature(31, "No.10 cutterhead motor torque", Unit::Percent, MOTOR_LOAD),
];

pub fn features() -> &'static [FeatureDescriptor] {
    &FEATURES
}

pub fn descriptor(id: u16) -> Option<&'static FeatureDescriptor> {
    let idx = usize::from(id).checked_sub(1)?;
    FEATURES.get(idx)
}
