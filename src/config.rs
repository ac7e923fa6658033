use crate::channel::Quantity;
use confique::Config;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub device_settings: DeviceSettings,
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub channel_settings: ChannelSettings,
}

#[derive(Config, Debug, Clone)]
pub struct DeviceSettings {
    /// Instrument endpoint, `host:port`.
    #[config(default = "127.0.0.1:8080")]
    pub addr: String,
    /// Per-block fetch deadline in milliseconds.
    #[config(default = 250)]
    pub fetch_timeout_ms: u64,
    #[config(default = 8)]
    pub num_analog_channels: usize,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = 128000)]
    pub samplerate: u64,
    /// 0 disables the limit.
    #[config(default = 0)]
    pub limit_samples: u64,
    #[config(default = 0)]
    pub limit_msec: u64,
    #[config(default = 0)]
    pub limit_frames: u64,
    #[config(default = 1000)]
    pub samples_per_frame: u64,
    #[config(default = 100)]
    pub tick_interval_ms: u64,
    #[config(default = false)]
    pub avg: bool,
    /// Averaging window; 0 defers emission to acquisition stop.
    #[config(default = 0)]
    pub avg_samples: u64,
    #[config(default = "GN14")]
    pub trigger_source: String,
    #[config(default = "POS")]
    pub trigger_slope: String,
    #[config(default = 0.0)]
    pub trigger_level: f64,
}

#[derive(Config, Debug, Clone)]
pub struct ChannelSettings {
    pub en_chans: ChannelConfig,
    pub quantity: QuantityConfig,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum ChannelConfig {
    All(bool),
    List(Vec<u32>),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum QuantityConfig {
    Global(Quantity),
    PerChannel(HashMap<String, Quantity>),
}
