//! # Tracker Wiring
//!
//! Builds every component from a [`Config`] and starts the worker threads:
//!
//! | thread            | blocks on                                   |
//! |-------------------|---------------------------------------------|
//! | `vehicle-sampler` | CAN filter queue / poll window (bounded)    |
//! | `correlator`      | fix event queue                             |
//! | `can-forwarder`   | CAN filter queue (only when configured)     |
//!
//! The serial receive path is not a thread here. The caller takes the
//! [`SerialInput`] and feeds it bytes from wherever they arrive (a UART interrupt, a
//! replayed capture). Publishing is driven by the caller as well, through
//! [`Tracker::publish`].

use crate::aggregator::Aggregator;
use crate::assembler::SentenceAssembler;
use crate::can::{CanBus, CanError};
use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::correlator::{CorrelatedRecord, Correlator};
use crate::fix_filter::FixFilter;
use crate::forwarder::{ForwardedFrame, FrameForwarder};
use crate::publish::{PublishQueue, PublishReport, Publisher, Sink};
use crate::sampler::VehicleSampler;
use crate::settings::Settings;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("CAN setup failed: {0}")]
    Can(#[from] CanError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The byte-fed front of the pipeline: assembler plus fix filter.
pub type SerialInput = SentenceAssembler<FixFilter>;

pub struct Tracker {
    settings: Arc<Settings>,
    aggregator: Arc<Aggregator>,
    running: Arc<AtomicBool>,
    serial: Option<SerialInput>,
    records: Publisher<CorrelatedRecord>,
    frames: Option<Publisher<ForwardedFrame>>,
    workers: Vec<JoinHandle<()>>,
}

impl Tracker {
    pub fn start(
        config: &Config,
        settings: Arc<Settings>,
        bus: Arc<dyn CanBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TrackerError> {
        config.validate()?;

        let aggregator = Arc::new(Aggregator::new(Duration::from_millis(
            config.correlation.lock_timeout_ms,
        )));
        let (fix_tx, fix_rx) = crossbeam_channel::bounded(config.gnss.fix_queue_capacity);
        let filter = FixFilter::new(settings.clone(), clock.clone(), fix_tx);
        let serial = SentenceAssembler::new(filter);

        let record_queue = PublishQueue::new(config.publish.queue_capacity);
        let correlator = Correlator::new(
            fix_rx,
            aggregator.clone(),
            record_queue.clone(),
            clock.clone(),
            config.correlation.mode,
        );
        let sampler = VehicleSampler::new(
            &config.can,
            bus.clone(),
            aggregator.clone(),
            settings.clone(),
            clock,
        )?;
        let forwarder = match &config.can.forward {
            Some(forward) => {
                let queue = PublishQueue::new(config.publish.queue_capacity);
                Some(FrameForwarder::new(bus.as_ref(), forward, queue)?)
            }
            None => None,
        };

        let mut tracker = Tracker {
            settings,
            aggregator,
            running: Arc::new(AtomicBool::new(true)),
            serial: Some(serial),
            records: Publisher::new(record_queue),
            frames: None,
            workers: Vec::new(),
        };

        // A failed spawn drops `tracker`, which stops whatever already started.
        tracker.workers.push(correlator.spawn(tracker.running.clone())?);
        tracker.workers.push(sampler.spawn(tracker.running.clone())?);
        if let Some(forwarder) = forwarder {
            tracker.frames = Some(Publisher::new(forwarder.output_queue()));
            tracker.workers.push(forwarder.spawn(tracker.running.clone())?);
        }

        info!(
            sampler = ?config.can.mode,
            correlation = ?config.correlation.mode,
            forwarding = tracker.frames.is_some(),
            "tracker started"
        );
        Ok(tracker)
    }

    /// Hand out the serial front end. Only the first call returns it.
    pub fn take_serial_input(&mut self) -> Option<SerialInput> {
        self.serial.take()
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn record_queue(&self) -> &PublishQueue<CorrelatedRecord> {
        self.records.queue()
    }

    /// Drain every publish queue into `sink`.
    pub fn publish<S: Sink + ?Sized>(&mut self, sink: &mut S) -> PublishReport {
        let mut report = self.records.drain(sink);
        if let Some(frames) = self.frames.as_mut() {
            report = report.merge(frames.drain(sink));
        }
        report
    }

    /// Stop and join the worker threads. Events already queued are still correlated.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
