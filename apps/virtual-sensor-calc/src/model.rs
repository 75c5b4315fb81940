use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hours 0-29 of the processing window; 24-29 fold in the next day's early hours.
pub const SLOT_COUNT: usize = 30;

pub const QUALITY_NORMAL: i32 = 1;
pub const QUALITY_ANOMALY: i32 = 2;

pub type Slots<T> = [T; SLOT_COUNT];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub id: String,
    pub expression: String,
    pub derived_sensor_name: String,
}

/// The four parallel per-slot series carried by every sensor row.
///
/// Storage columns follow the plant naming: `d0` is the assurance (quality)
/// code, `d1`..`d3` are the three measurement variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Quality,
    Primary,
    Secondary,
    Tertiary,
}

impl Channel {
    pub const MEASUREMENTS: [Channel; 3] =
        [Channel::Primary, Channel::Secondary, Channel::Tertiary];

    pub fn column(self) -> &'static str {
        match self {
            Channel::Quality => "d0",
            Channel::Primary => "d1",
            Channel::Secondary => "d2",
            Channel::Tertiary => "d3",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Quality => "quality",
            Channel::Primary => "primary",
            Channel::Secondary => "secondary",
            Channel::Tertiary => "tertiary",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.column())
    }
}

/// One raw sensor row: a single tag at a single factory for one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub factory: String,
    pub tag: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub local_tag: String,
    #[serde(default)]
    pub local_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub data_division: String,
    pub quality: Slots<Option<i32>>,
    pub primary: Slots<Option<f64>>,
    pub secondary: Slots<Option<f64>>,
    pub tertiary: Slots<Option<f64>>,
}

impl SensorReading {
    /// Measurement series for `channel`; `None` for [`Channel::Quality`].
    pub fn measurement(&self, channel: Channel) -> Option<&Slots<Option<f64>>> {
        match channel {
            Channel::Quality => None,
            Channel::Primary => Some(&self.primary),
            Channel::Secondary => Some(&self.secondary),
            Channel::Tertiary => Some(&self.tertiary),
        }
    }

    /// First null slot across all four channels, in channel then slot order.
    pub fn first_missing(&self) -> Option<(Channel, usize)> {
        if let Some(slot) = self.quality.iter().position(Option::is_none) {
            return Some((Channel::Quality, slot));
        }
        Channel::MEASUREMENTS.into_iter().find_map(|channel| {
            self.measurement(channel)
                .and_then(|values| values.iter().position(Option::is_none))
                .map(|slot| (channel, slot))
        })
    }
}

/// Derived sensor row produced for one `(factory, date)` partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub factory: String,
    pub tag: String,
    pub date: NaiveDate,
    pub local_tag: String,
    pub local_id: String,
    pub display_name: String,
    pub unit: String,
    pub data_division: String,
    pub quality: Slots<i32>,
    pub primary: Slots<Option<f64>>,
    pub secondary: Slots<Option<f64>>,
    pub tertiary: Slots<Option<f64>>,
}

impl CalculationResult {
    pub fn measurement(&self, channel: Channel) -> Option<&Slots<Option<f64>>> {
        match channel {
            Channel::Quality => None,
            Channel::Primary => Some(&self.primary),
            Channel::Secondary => Some(&self.secondary),
            Channel::Tertiary => Some(&self.tertiary),
        }
    }

    pub fn failed_slots(&self) -> usize {
        [&self.primary, &self.secondary, &self.tertiary]
            .iter()
            .map(|values| values.iter().filter(|value| value.is_none()).count())
            .sum()
    }
}
