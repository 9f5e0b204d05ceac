//! # CAN Transport Interface
//!
//! The core only needs two things from a CAN controller:
//! - **Filtered delivery**: register an identifier filter and get matching frames on a
//!   bounded queue (drop-newest when the consumer falls behind)
//! - **Send with timeout**: queue one frame for transmission, giving up after a bound
//!
//! [`CanBus`] captures exactly that. The physical driver is out of scope; [`VirtualBus`]
//! is an in-process bus used by the host driver and the tests. It can replay candump
//! logs and answer requests through a responder closure standing in for an ECU.
//!
//! ## Candump Format
//! ```text
//! (1436509052.249713) can0 244#0000001234
//! can0 7E8#03410D32
//! 18DAF110#0241
//! 7DF#R
//! ```
//! Three hex digits of identifier mean a standard frame, eight mean extended.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Largest classic CAN payload.
pub const MAX_DLC: usize = 8;

/// Highest 11-bit identifier.
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest 29-bit identifier.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanError {
    #[error("identifier {0:#X} out of range")]
    InvalidId(u32),

    #[error("payload of {0} bytes exceeds 8")]
    PayloadTooLong(usize),

    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("bus is offline")]
    Offline,

    #[error("malformed candump line: {0}")]
    Candump(String),
}

/// One classic CAN frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: u32,
    pub dlc: u8,
    pub data: [u8; MAX_DLC],
    pub extended: bool,
    pub remote: bool,
}

impl CanFrame {
    /// Standard (11-bit) data frame.
    pub fn new(id: u32, payload: &[u8]) -> Result<Self, CanError> {
        Self::build(id, payload, false)
    }

    /// Extended (29-bit) data frame.
    pub fn new_extended(id: u32, payload: &[u8]) -> Result<Self, CanError> {
        Self::build(id, payload, true)
    }

    /// Remote transmission request with the given length code.
    pub fn new_remote(id: u32, dlc: u8, extended: bool) -> Result<Self, CanError> {
        if dlc as usize > MAX_DLC {
            return Err(CanError::PayloadTooLong(dlc as usize));
        }
        let mut frame = Self::build(id, &[], extended)?;
        frame.dlc = dlc;
        frame.remote = true;
        Ok(frame)
    }

    fn build(id: u32, payload: &[u8], extended: bool) -> Result<Self, CanError> {
        let max_id = if extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if id > max_id {
            return Err(CanError::InvalidId(id));
        }
        if payload.len() > MAX_DLC {
            return Err(CanError::PayloadTooLong(payload.len()));
        }
        let mut data = [0u8; MAX_DLC];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            dlc: payload.len() as u8,
            data,
            extended,
            remote: false,
        })
    }

    /// The first `dlc` data bytes (empty for remote frames).
    pub fn payload(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.dlc as usize]
        }
    }

    /// Parse one compact candump line, with or without the timestamp and interface.
    pub fn from_candump(line: &str) -> Result<Self, CanError> {
        let malformed = || CanError::Candump(line.trim().to_string());

        let token = line
            .split_whitespace()
            .find(|token| token.contains('#'))
            .ok_or_else(malformed)?;
        let (id_hex, body) = token.split_once('#').ok_or_else(malformed)?;

        let extended = match id_hex.len() {
            3 => false,
            8 => true,
            _ => return Err(malformed()),
        };
        let id = u32::from_str_radix(id_hex, 16).map_err(|_| malformed())?;

        if let Some(len) = body.strip_prefix('R') {
            let dlc = if len.is_empty() {
                0
            } else {
                len.parse::<u8>().map_err(|_| malformed())?
            };
            return Self::new_remote(id, dlc, extended);
        }

        if body.len() % 2 != 0 || body.len() > MAX_DLC * 2 {
            return Err(malformed());
        }
        let mut payload = [0u8; MAX_DLC];
        let count = body.len() / 2;
        for (i, slot) in payload.iter_mut().take(count).enumerate() {
            *slot = u8::from_str_radix(&body[i * 2..i * 2 + 2], 16).map_err(|_| malformed())?;
        }
        Self::build(id, &payload[..count], extended)
    }
}

impl fmt::Display for CanFrame {
    /// Compact candump notation, e.g. `7E8#03410D32`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}#", self.id)?;
        } else {
            write!(f, "{:03X}#", self.id)?;
        }
        if self.remote {
            return write!(f, "R{}", self.dlc);
        }
        for byte in self.payload() {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Identifier acceptance filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanFilter {
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
}

impl CanFilter {
    /// Accept exactly one identifier.
    pub fn exact(id: u32, extended: bool) -> Self {
        let mask = if extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        Self { id, mask, extended }
    }

    pub fn matches(&self, frame: &CanFrame) -> bool {
        frame.extended == self.extended && (frame.id & self.mask) == (self.id & self.mask)
    }
}

/// What the vehicle samplers and the forwarder need from a CAN controller.
pub trait CanBus: Send + Sync {
    /// Install an acceptance filter. Matching frames are delivered to the returned
    /// receiver; when it holds `capacity` frames, newer ones are dropped.
    fn add_rx_filter(
        &self,
        filter: CanFilter,
        capacity: usize,
    ) -> Result<Receiver<CanFrame>, CanError>;

    /// Transmit one frame, waiting at most `timeout` for a free mailbox.
    fn send(&self, frame: &CanFrame, timeout: Duration) -> Result<(), CanError>;
}

type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

struct Subscriber {
    filter: CanFilter,
    tx: Sender<CanFrame>,
}

/// In-process CAN bus.
///
/// Frames reach subscribers through [`VirtualBus::inject`] (a replayed log or another
/// node) or as answers from the responder after a [`CanBus::send`].
#[derive(Default)]
pub struct VirtualBus {
    subscribers: Mutex<Vec<Subscriber>>,
    responder: Mutex<Option<Responder>>,
    offline: AtomicBool,
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every sent frame with whatever `responder` returns.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Make `send` fail, as a controller in bus-off would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Deliver a received frame to every matching filter. Returns how many took it.
    pub fn inject(&self, frame: CanFrame) -> usize {
        let mut accepted = 0;
        self.subscribers.lock().retain(|sub| {
            if !sub.filter.matches(&frame) {
                return true;
            }
            match sub.tx.try_send(frame) {
                Ok(()) => {
                    accepted += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(%frame, "filter queue full, dropping frame");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
        self.delivered.fetch_add(accepted as u64, Ordering::Relaxed);
        accepted
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl CanBus for VirtualBus {
    fn add_rx_filter(
        &self,
        filter: CanFilter,
        capacity: usize,
    ) -> Result<Receiver<CanFrame>, CanError> {
        let max_id = if filter.extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if filter.id > max_id {
            return Err(CanError::InvalidId(filter.id));
        }
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        self.subscribers.lock().push(Subscriber { filter, tx });
        debug!(id = format_args!("{:#X}", filter.id), "rx filter added");
        Ok(rx)
    }

    fn send(&self, frame: &CanFrame, timeout: Duration) -> Result<(), CanError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(CanError::SendTimeout(timeout));
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        trace!(%frame, "frame sent");

        // Collect first so the responder lock is not held while delivering.
        let responses = match self.responder.lock().as_mut() {
            Some(responder) => responder(frame),
            None => Vec::new(),
        };
        for response in responses {
            self.inject(response);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_construction_limits() {
        assert_eq!(CanFrame::new(0x800, &[]), Err(CanError::InvalidId(0x800)));
        assert_eq!(
            CanFrame::new(0x100, &[0; 9]),
            Err(CanError::PayloadTooLong(9))
        );
        let frame = CanFrame::new_extended(0x244, &[1, 2, 3]).unwrap();
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(frame.dlc, 3);
    }

    #[test]
    fn test_candump_parsing() {
        let frame = CanFrame::from_candump("(1436509052.249713) can0 00000244#0000001234").unwrap();
        assert!(frame.extended);
        assert_eq!(frame.id, 0x244);
        assert_eq!(frame.payload(), &[0x00, 0x00, 0x00, 0x12, 0x34]);

        let frame = CanFrame::from_candump("can0 7E8#03410D32").unwrap();
        assert!(!frame.extended);
        assert_eq!(frame.payload(), &[0x03, 0x41, 0x0D, 0x32]);

        let frame = CanFrame::from_candump("7DF#R").unwrap();
        assert!(frame.remote);
        assert!(frame.payload().is_empty());

        assert!(CanFrame::from_candump("can0 7E8#0341F").is_err());
        assert!(CanFrame::from_candump("can0 7E8 03410D32").is_err());
        assert!(CanFrame::from_candump("0244#00").is_err());
    }

    #[test]
    fn test_display_is_candump_notation() {
        let frame = CanFrame::new(0x7E8, &[0x03, 0x41, 0x0D, 0x32]).unwrap();
        assert_eq!(frame.to_string(), "7E8#03410D32");
        let reparsed = CanFrame::from_candump(&frame.to_string()).unwrap();
        assert_eq!(reparsed, frame);
    }

    #[test]
    fn test_filter_matches_id_and_format() {
        let filter = CanFilter::exact(0x244, true);
        assert!(filter.matches(&CanFrame::new_extended(0x244, &[]).unwrap()));
        assert!(!filter.matches(&CanFrame::new(0x244, &[]).unwrap()));
        assert!(!filter.matches(&CanFrame::new_extended(0x245, &[]).unwrap()));
    }

    #[test]
    fn test_inject_drops_newest_when_filter_queue_full() {
        let bus = VirtualBus::new();
        let rx = bus.add_rx_filter(CanFilter::exact(0x123, false), 2).unwrap();
        for value in 0..3u8 {
            bus.inject(CanFrame::new(0x123, &[value]).unwrap());
        }
        assert_eq!(bus.dropped(), 1);
        let kept: Vec<u8> = rx.try_iter().map(|f| f.data[0]).collect();
        assert_eq!(kept, vec![0, 1]);
    }

    #[test]
    fn test_responder_answers_sent_frames() {
        let bus = VirtualBus::new();
        let rx = bus.add_rx_filter(CanFilter::exact(0x7E8, false), 4).unwrap();
        bus.set_responder(|request| {
            vec![CanFrame::new(0x7E8, &[0x03, 0x41, request.data[2], 50]).unwrap()]
        });

        let request = CanFrame::new(0x7DF, &[0x02, 0x01, 0x0D]).unwrap();
        bus.send(&request, Duration::from_millis(100)).unwrap();
        assert_eq!(bus.sent(), 1);
        assert_eq!(rx.try_recv().unwrap().data[3], 50);
    }

    #[test]
    fn test_offline_bus_fails_send() {
        let bus = VirtualBus::new();
        bus.set_offline(true);
        let frame = CanFrame::new(0x7DF, &[]).unwrap();
        assert_eq!(
            bus.send(&frame, Duration::from_millis(100)),
            Err(CanError::SendTimeout(Duration::from_millis(100)))
        );
        assert_eq!(bus.sent(), 0);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus = VirtualBus::new();
        drop(bus.add_rx_filter(CanFilter::exact(0x123, false), 1).unwrap());
        assert_eq!(bus.inject(CanFrame::new(0x123, &[]).unwrap()), 0);
        assert!(bus.subscribers.lock().is_empty());
    }
}
