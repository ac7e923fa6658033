//! Device context and the generic key/value configuration surface.

use crate::channel::{ChannelGenerator, Quantity, CHANNEL_NAMES};
use crate::config::{ChannelConfig, Conf, QuantityConfig};
use crate::error::{Result, ScopeError};
use std::collections::HashMap;

/// Sample rates the instrument supports, in Hz.
pub const SAMPLERATES: [u64; 5] = [1024000, 512000, 256000, 204800, 128000];

pub const TRIGGER_SLOPES: [&str; 2] = ["POS", "NEG"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    Samplerate,
    LimitSamples,
    LimitMsec,
    LimitFrames,
    TriggerSource,
    TriggerSlope,
    TriggerLevel,
    MeasuredQuantity,
}

impl ConfigKey {
    fn name(self) -> &'static str {
        match self {
            ConfigKey::Samplerate => "samplerate",
            ConfigKey::LimitSamples => "limit_samples",
            ConfigKey::LimitMsec => "limit_msec",
            ConfigKey::LimitFrames => "limit_frames",
            ConfigKey::TriggerSource => "trigger_source",
            ConfigKey::TriggerSlope => "trigger_slope",
            ConfigKey::TriggerLevel => "trigger_level",
            ConfigKey::MeasuredQuantity => "measured_quantity",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    UInt(u64),
    Float(f64),
    Str(String),
    Quantity(Quantity),
}

/// Per-acquisition device state. Exactly one instance exists per active
/// acquisition; channel generators are built at scan time and dropped at
/// clear time.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub cur_samplerate: u64,
    pub limit_samples: u64,
    pub limit_msec: u64,
    pub limit_frames: u64,
    pub samples_per_frame: u64,
    pub avg: bool,
    pub avg_samples: u64,
    pub trigger_source: String,
    pub trigger_slope: String,
    pub trigger_level: f64,
    pub num_analog_channels: usize,
    pub channels: HashMap<usize, ChannelGenerator>,
}

impl DeviceContext {
    /// Build the device context and its channel generators from the file
    /// configuration. Invalid values are rejected before any state exists.
    pub fn scan(conf: &Conf) -> Result<Self> {
        let run = &conf.run_settings;
        if !SAMPLERATES.contains(&run.samplerate) {
            return Err(ScopeError::ConfigValue {
                key: "samplerate".into(),
                reason: format!("{} Hz is not a supported rate", run.samplerate),
            });
        }
        if !TRIGGER_SLOPES.contains(&run.trigger_slope.as_str()) {
            return Err(ScopeError::ConfigValue {
                key: "trigger_slope".into(),
                reason: format!("unknown slope {:?}", run.trigger_slope),
            });
        }
        if !CHANNEL_NAMES.contains(&run.trigger_source.as_str()) {
            return Err(ScopeError::ConfigValue {
                key: "trigger_source".into(),
                reason: format!("unknown channel {:?}", run.trigger_source),
            });
        }

        let num_channels = conf.device_settings.num_analog_channels;
        if num_channels == 0 || num_channels > CHANNEL_NAMES.len() {
            return Err(ScopeError::ConfigValue {
                key: "num_analog_channels".into(),
                reason: format!("must be 1..={}", CHANNEL_NAMES.len()),
            });
        }

        let mut channels = HashMap::new();
        for index in 0..num_channels {
            let mut gen = ChannelGenerator::new(index);
            gen.enabled = match &conf.channel_settings.en_chans {
                ChannelConfig::All(enabled) => *enabled,
                ChannelConfig::List(list) => list.contains(&(index as u32)),
            };
            gen.quantity = match &conf.channel_settings.quantity {
                QuantityConfig::Global(q) => *q,
                QuantityConfig::PerChannel(map) => map
                    .get(&index.to_string())
                    .copied()
                    .unwrap_or(Quantity::Voltage),
            };
            channels.insert(index, gen);
        }

        Ok(Self {
            cur_samplerate: run.samplerate,
            limit_samples: run.limit_samples,
            limit_msec: run.limit_msec,
            limit_frames: run.limit_frames,
            samples_per_frame: run.samples_per_frame,
            avg: run.avg,
            avg_samples: run.avg_samples,
            trigger_source: run.trigger_source.clone(),
            trigger_slope: run.trigger_slope.clone(),
            trigger_level: run.trigger_level,
            num_analog_channels: num_channels,
            channels,
        })
    }

    /// Drop all channel generators.
    pub fn clear(&mut self) {
        self.channels.clear();
    }

    pub fn enabled_channels(&self) -> usize {
        self.channels.values().filter(|g| g.enabled).count()
    }

    pub fn get(&self, key: ConfigKey, channel: Option<usize>) -> Result<ConfigValue> {
        match key {
            ConfigKey::Samplerate => Ok(ConfigValue::UInt(self.cur_samplerate)),
            ConfigKey::LimitSamples => Ok(ConfigValue::UInt(self.limit_samples)),
            ConfigKey::LimitMsec => Ok(ConfigValue::UInt(self.limit_msec)),
            ConfigKey::LimitFrames => Ok(ConfigValue::UInt(self.limit_frames)),
            ConfigKey::TriggerSource => Ok(ConfigValue::Str(self.trigger_source.clone())),
            ConfigKey::TriggerSlope => Ok(ConfigValue::Str(self.trigger_slope.clone())),
            ConfigKey::TriggerLevel => Ok(ConfigValue::Float(self.trigger_level)),
            ConfigKey::MeasuredQuantity => {
                let gen = self.channel_group(key, channel)?;
                Ok(ConfigValue::Quantity(gen.quantity))
            }
        }
    }

    pub fn set(&mut self, key: ConfigKey, channel: Option<usize>, value: ConfigValue) -> Result<()> {
        match (key, value) {
            (ConfigKey::Samplerate, ConfigValue::UInt(rate)) => {
                if !SAMPLERATES.contains(&rate) {
                    return Err(Self::bad_value(key, format!("{rate} Hz is not supported")));
                }
                self.cur_samplerate = rate;
            }
            // Sample and time limits are mutually exclusive; setting one
            // clears the other.
            (ConfigKey::LimitSamples, ConfigValue::UInt(n)) => {
                self.limit_msec = 0;
                self.limit_samples = n;
            }
            (ConfigKey::LimitMsec, ConfigValue::UInt(ms)) => {
                self.limit_samples = 0;
                self.limit_msec = ms;
            }
            (ConfigKey::LimitFrames, ConfigValue::UInt(n)) => self.limit_frames = n,
            (ConfigKey::TriggerSource, ConfigValue::Str(source)) => {
                if !CHANNEL_NAMES.contains(&source.as_str()) {
                    return Err(Self::bad_value(key, format!("unknown channel {source:?}")));
                }
                self.trigger_source = source;
            }
            (ConfigKey::TriggerSlope, ConfigValue::Str(slope)) => {
                if !TRIGGER_SLOPES.contains(&slope.as_str()) {
                    return Err(Self::bad_value(key, format!("unknown slope {slope:?}")));
                }
                self.trigger_slope = slope;
            }
            (ConfigKey::TriggerLevel, ConfigValue::Float(level)) => self.trigger_level = level,
            (ConfigKey::MeasuredQuantity, ConfigValue::Quantity(q)) => {
                let index = self.channel_group(key, channel)?.index;
                if let Some(gen) = self.channels.get_mut(&index) {
                    gen.quantity = q;
                }
            }
            (key, value) => {
                return Err(Self::bad_value(key, format!("wrong value type {value:?}")));
            }
        }
        Ok(())
    }

    pub fn list(&self, key: ConfigKey) -> Result<Vec<ConfigValue>> {
        match key {
            ConfigKey::Samplerate => Ok(SAMPLERATES.iter().map(|&r| ConfigValue::UInt(r)).collect()),
            ConfigKey::TriggerSource => Ok(CHANNEL_NAMES
                .iter()
                .map(|&n| ConfigValue::Str(n.to_string()))
                .collect()),
            ConfigKey::TriggerSlope => Ok(TRIGGER_SLOPES
                .iter()
                .map(|&s| ConfigValue::Str(s.to_string()))
                .collect()),
            _ => Err(ScopeError::ConfigKey(key.name().to_string())),
        }
    }

    fn channel_group(&self, key: ConfigKey, channel: Option<usize>) -> Result<&ChannelGenerator> {
        let index = channel.ok_or_else(|| {
            ScopeError::ConfigKey(format!("{} requires a channel group", key.name()))
        })?;
        self.channels
            .get(&index)
            .ok_or_else(|| Self::bad_value(key, format!("no such channel {index}")))
    }

    fn bad_value(key: ConfigKey, reason: String) -> ScopeError {
        ScopeError::ConfigValue {
            key: key.name().to_string(),
            reason,
        }
    }
}
