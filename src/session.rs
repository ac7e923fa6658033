//! Session sink interface and the analog packet emitter.

use crate::channel::{ChannelGenerator, Quantity, Unit};
use log::{debug, info};

/// One channel's decoded samples plus emitter metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogPacket {
    pub channel: usize,
    pub name: &'static str,
    pub quantity: Quantity,
    pub unit: Unit,
    pub samples: Vec<f32>,
}

/// External data sink. Publishing is fire-and-forget; delivery guarantees
/// are the sink's problem.
pub trait Session {
    fn begin_stream(&mut self);
    fn begin_frame(&mut self);
    fn end_frame(&mut self);
    fn end_stream(&mut self);
    fn publish(&mut self, packet: AnalogPacket);
}

/// Wrap a channel's sample buffer and hand it to the sink. Disabled channels
/// and empty buffers produce nothing.
pub fn emit<S: Session>(session: &mut S, gen: &ChannelGenerator, samples: Vec<f32>) {
    if !gen.enabled || samples.is_empty() {
        return;
    }
    session.publish(AnalogPacket {
        channel: gen.index,
        name: gen.name,
        quantity: gen.quantity,
        unit: gen.quantity.unit(),
        samples,
    });
}

/// Sink that reports markers and packet sizes through the log.
#[derive(Debug, Default)]
pub struct LogSession {
    frames: u64,
}

impl Session for LogSession {
    fn begin_stream(&mut self) {
        info!("stream begin");
    }

    fn begin_frame(&mut self) {
        self.frames += 1;
        debug!("frame {} begin", self.frames);
    }

    fn end_frame(&mut self) {
        debug!("frame {} end", self.frames);
    }

    fn end_stream(&mut self) {
        info!("stream end after {} frames", self.frames);
    }

    fn publish(&mut self, packet: AnalogPacket) {
        debug!(
            "{}: {} samples ({:?})",
            packet.name,
            packet.samples.len(),
            packet.quantity
        );
    }
}
