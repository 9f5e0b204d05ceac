//! Raw CAN frame forwarding.
//!
//! Optionally mirrors every frame matching one identifier onto the `"can"` stream,
//! independent of speed sampling. Frames go through the same drop-newest
//! [`PublishQueue`] discipline as correlated records.

use crate::can::{CanBus, CanError, CanFilter, CanFrame};
use crate::config::ForwardConfig;
use crate::publish::{PublishQueue, Publishable, SinkError};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CAN_STREAM: &str = "can";

const STOP_CHECK: Duration = Duration::from_millis(100);

/// A raw frame bound for the `"can"` stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwardedFrame(pub CanFrame);

#[derive(Serialize)]
struct FramePayload<'a> {
    id: u32,
    dlc: u8,
    ide: bool,
    rtr: bool,
    data: &'a [u8],
}

impl Publishable for ForwardedFrame {
    fn stream(&self) -> &'static str {
        CAN_STREAM
    }

    fn encode(&self) -> Result<Vec<u8>, SinkError> {
        let frame = &self.0;
        Ok(serde_json::to_vec(&FramePayload {
            id: frame.id,
            dlc: frame.dlc,
            ide: frame.extended,
            rtr: frame.remote,
            data: frame.payload(),
        })?)
    }
}

pub struct FrameForwarder {
    frames: Receiver<CanFrame>,
    output: PublishQueue<ForwardedFrame>,
}

impl FrameForwarder {
    pub fn new(
        bus: &dyn CanBus,
        config: &ForwardConfig,
        output: PublishQueue<ForwardedFrame>,
    ) -> Result<Self, CanError> {
        let frames = bus.add_rx_filter(
            CanFilter::exact(config.id, config.extended),
            config.queue_capacity,
        )?;
        Ok(Self { frames, output })
    }

    pub fn output_queue(&self) -> PublishQueue<ForwardedFrame> {
        self.output.clone()
    }

    /// Queue one frame for publishing. Returns `false` if the queue was full.
    pub fn forward(&self, frame: CanFrame) -> bool {
        debug!(%frame, "forwarding CAN frame");
        if self.output.try_push(ForwardedFrame(frame)).is_err() {
            warn!(%frame, "CAN publish queue full, dropping frame");
            return false;
        }
        true
    }

    pub fn run(&self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            match self.frames.recv_timeout(STOP_CHECK) {
                Ok(frame) => {
                    self.forward(frame);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    pub fn spawn(self, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("can-forwarder".into())
            .spawn(move || {
                info!("CAN forwarder started");
                self.run(&running);
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::VirtualBus;
    use serde_json::{json, Value};

    #[test]
    fn test_forwarded_frame_payload() {
        let frame = CanFrame::new_extended(0x123, &[0xDE, 0xAD]).unwrap();
        let encoded = ForwardedFrame(frame).encode().unwrap();
        let payload: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(
            payload,
            json!({ "id": 0x123, "dlc": 2, "ide": true, "rtr": false, "data": [0xDE, 0xAD] })
        );
    }

    #[test]
    fn test_only_matching_frames_are_forwarded() {
        let bus = VirtualBus::new();
        let queue = PublishQueue::new(4);
        let forwarder =
            FrameForwarder::new(&bus, &ForwardConfig::default(), queue.clone()).unwrap();

        bus.inject(CanFrame::new_extended(0x123, &[1]).unwrap());
        bus.inject(CanFrame::new(0x123, &[2]).unwrap());
        bus.inject(CanFrame::new_extended(0x124, &[3]).unwrap());
        while let Ok(frame) = forwarder.frames.try_recv() {
            forwarder.forward(frame);
        }

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop().unwrap().0.data[0], 1);
    }
}
