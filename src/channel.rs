use serde::Deserialize;

/// Pin names of the instrument's analog inputs, in round-robin order.
pub const CHANNEL_NAMES: [&str; 8] = [
    "GN14", "GP14", "GN15", "GP15", "GN16", "GP16", "GN17", "GP17",
];

pub const DEFAULT_NUM_CHANNELS: usize = 8;

/// The measured quantity tagged onto a channel's packets.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
    Current,
    Resistance,
    Capacitance,
    Temperature,
    Frequency,
    Power,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Farad,
    Celsius,
    Hertz,
    Watt,
}

impl Quantity {
    pub fn unit(self) -> Unit {
        match self {
            Quantity::Voltage => Unit::Volt,
            Quantity::Current => Unit::Ampere,
            Quantity::Resistance => Unit::Ohm,
            Quantity::Capacitance => Unit::Farad,
            Quantity::Temperature => Unit::Celsius,
            Quantity::Frequency => Unit::Hertz,
            Quantity::Power => Unit::Watt,
        }
    }
}

/// Per-channel state: stable identity, emitter metadata and the running
/// exponential-average accumulator.
#[derive(Debug, Clone)]
pub struct ChannelGenerator {
    pub index: usize,
    pub name: &'static str,
    pub quantity: Quantity,
    pub enabled: bool,
    avg_val: f32,
    num_avgs: u64,
}

impl ChannelGenerator {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            name: CHANNEL_NAMES[index % CHANNEL_NAMES.len()],
            quantity: Quantity::Voltage,
            enabled: true,
            avg_val: 0.0,
            num_avgs: 0,
        }
    }

    /// Fold one sample into the running average: `avg = (avg + sample) / 2`.
    pub fn accumulate(&mut self, sample: f32) {
        self.avg_val = (self.avg_val + sample) / 2.0;
        self.num_avgs += 1;
    }

    pub fn num_avgs(&self) -> u64 {
        self.num_avgs
    }

    /// Current average, resetting the in-window counter. The accumulator
    /// itself keeps running across windows. Returns `None` when no sample
    /// has been folded in since the last take.
    pub fn take_average(&mut self) -> Option<f32> {
        if self.num_avgs == 0 {
            return None;
        }
        self.num_avgs = 0;
        Some(self.avg_val)
    }
}
