pub mod acquisition;
pub mod channel;
pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod protocol;
pub mod session;
pub mod stats;

pub use acquisition::{AcqState, Acquisition, Tick, TriggerSearch};
pub use channel::{ChannelGenerator, Quantity, Unit, CHANNEL_NAMES, DEFAULT_NUM_CHANNELS};
pub use config::{ChannelConfig, Conf, QuantityConfig};
pub use decode::{decode, demux, DecodeCursor, TaggedSample, DATA_TAG, SAMPLE_WIDTH};
pub use device::{ConfigKey, ConfigValue, DeviceContext, SAMPLERATES, TRIGGER_SLOPES};
pub use error::{Result, ScopeError};
pub use protocol::{
    build_request, BlockSource, UdpTransport, BLOCK, BLOCKS_PER_PASS, DEFAULT_PORT, PASS_LEN,
    RESPONSE_LEN,
};
pub use session::{emit, AnalogPacket, LogSession, Session};
pub use stats::Counter;
