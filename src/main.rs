//! # CAN Asset Tracker Host Driver
//!
//! Runs the tracker core on a host machine. The GNSS serial line is simulated by
//! replaying an NMEA capture into the assembler in small bursts, the CAN bus by an
//! in-process [`VirtualBus`] fed from a candump log and, optionally, a simulated ECU
//! answering OBD2 speed requests. Correlated records are printed to stdout as JSON lines
//! every `LOOP_DELAY_S` seconds; logs go to stderr.
//!
//! ```text
//! can-asset-tracker --nmea drive.nmea --simulate-ecu 72
//! can-asset-tracker --config tracker-config.toml --nmea drive.nmea --candump drive.log
//! can-asset-tracker --write-config tracker-config.toml
//! ```

// Test modules
#[cfg(test)]
mod tests;

use anyhow::{bail, Context};
use asset_tracker_lib::can::{CanFrame, VirtualBus};
use asset_tracker_lib::clock::MonotonicClock;
use asset_tracker_lib::config::Config;
use asset_tracker_lib::logging;
use asset_tracker_lib::publish::JsonLinesSink;
use asset_tracker_lib::sampler::{speed_response_frame, OBD_PID_VEHICLE_SPEED};
use asset_tracker_lib::settings::{SettingKey, Settings};
use asset_tracker_lib::tracker::{SerialInput, Tracker};
use crossbeam_channel::RecvTimeoutError;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Bytes handed to the assembler per simulated receive interrupt.
const SERIAL_BURST: usize = 8;

/// How often the settings bridge checks whether the publish loop is still alive.
const WATCH_POLL: Duration = Duration::from_millis(100);

/// Command line options.
#[derive(Debug, Default, PartialEq)]
struct Options {
    config: Option<PathBuf>,
    settings: Option<PathBuf>,
    nmea: Option<PathBuf>,
    line_delay_ms: u64,
    candump: Option<PathBuf>,
    frame_delay_ms: u64,
    simulate_ecu: Option<u8>,
    write_config: Option<PathBuf>,
}

impl Options {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut options = Options {
            line_delay_ms: 100,
            frame_delay_ms: 10,
            ..Options::default()
        };
        let mut args = args.into_iter();
        while let Some(flag) = args.next() {
            let mut value = || {
                args.next()
                    .with_context(|| format!("{flag} expects a value"))
            };
            match flag.as_str() {
                "--config" => options.config = Some(value()?.into()),
                "--settings" => options.settings = Some(value()?.into()),
                "--nmea" => options.nmea = Some(value()?.into()),
                "--line-delay-ms" => options.line_delay_ms = value()?.parse()?,
                "--candump" => options.candump = Some(value()?.into()),
                "--frame-delay-ms" => options.frame_delay_ms = value()?.parse()?,
                "--simulate-ecu" => {
                    let kmh = value()?;
                    options.simulate_ecu = Some(
                        kmh.parse()
                            .with_context(|| format!("invalid speed {kmh}, expected 0-255 km/h"))?,
                    );
                }
                "--write-config" => options.write_config = Some(value()?.into()),
                other => bail!("unknown argument {other}"),
            }
        }
        Ok(options)
    }
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    if let Err(e) = logging::init_logging(logging::DEFAULT_DIRECTIVE) {
        eprintln!("Logging setup failed: {e}");
    }

    let options = Options::parse(env::args().skip(1))?;

    let config = match &options.config {
        Some(path) => Config::try_load_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::load(),
    };

    if let Some(path) = &options.write_config {
        config.save_to_path(path)?;
        return Ok(());
    }

    if options.nmea.is_none() && options.candump.is_none() {
        bail!("nothing to replay: pass --nmea and/or --candump");
    }

    let settings = Arc::new(Settings::with_initial(&config.settings));
    if let Some(path) = &options.settings {
        apply_settings_file(&settings, path)?;
    }

    let bus = Arc::new(VirtualBus::new());
    if let Some(kmh) = options.simulate_ecu {
        let response_id = config.can.response_id;
        bus.set_responder(move |request| {
            let asks_for_speed = request.payload().get(2) == Some(&OBD_PID_VEHICLE_SPEED);
            match speed_response_frame(response_id, kmh) {
                Ok(response) if asks_for_speed => vec![response],
                _ => Vec::new(),
            }
        });
        info!(kmh, "simulated ECU answering speed requests");
    }

    let mut tracker = Tracker::start(
        &config,
        settings.clone(),
        bus.clone(),
        Arc::new(MonotonicClock::new()),
    )?;
    let serial = tracker
        .take_serial_input()
        .context("serial input already taken")?;

    // Create Tokio runtime for the replay and publish cadence
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(&mut tracker, serial, bus, &settings, &options))
}

/// Replay inputs while publishing every `LOOP_DELAY_S`, then shut down and drain.
async fn run(
    tracker: &mut Tracker,
    serial: SerialInput,
    bus: Arc<VirtualBus>,
    settings: &Settings,
    options: &Options,
) -> anyhow::Result<()> {
    let mut sink = JsonLinesSink::new(io::stdout());

    let nmea = replay_nmea(
        options.nmea.clone(),
        serial,
        Duration::from_millis(options.line_delay_ms),
    );
    let candump = replay_candump(
        options.candump.clone(),
        bus,
        Duration::from_millis(options.frame_delay_ms),
    );
    let inputs = async { tokio::try_join!(nmea, candump) };
    tokio::pin!(inputs);
    let watch = LoopDelayWatch::spawn(settings);

    loop {
        tokio::select! {
            result = &mut inputs => {
                result?;
                break;
            }
            _ = wait_for_publish(settings, &watch) => {
                let report = tracker.publish(&mut sink);
                debug!(published = report.published, failed = report.failed, "publish cycle");
            }
        }
    }

    info!("inputs exhausted, shutting down");
    tracker.shutdown();
    let report = tracker.publish(&mut sink);
    info!(
        published = report.published,
        failed = report.failed,
        dropped = tracker.record_queue().dropped(),
        lock_timeouts = tracker.aggregator().dropped_updates(),
        "final drain"
    );
    Ok(())
}

/// Wakes the publish loop when `LOOP_DELAY_S` changes.
///
/// Settings notifications arrive on a crossbeam channel, so a blocking task relays
/// them into a [`Notify`]. The task exits once the watch is dropped.
struct LoopDelayWatch {
    notify: Arc<Notify>,
}

impl LoopDelayWatch {
    fn spawn(settings: &Settings) -> Self {
        let changes = settings.subscribe();
        let notify = Arc::new(Notify::new());
        let relay = Arc::downgrade(&notify);
        tokio::task::spawn_blocking(move || {
            while let Some(notify) = relay.upgrade() {
                match changes.recv_timeout(WATCH_POLL) {
                    Ok(SettingKey::LoopDelay) => notify.notify_one(),
                    Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Self { notify }
    }

    async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// Sleep for `LOOP_DELAY_S`, starting over with the new value whenever it changes.
async fn wait_for_publish(settings: &Settings, watch: &LoopDelayWatch) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(settings.loop_delay()) => return,
            _ = watch.changed() => {
                debug!(loop_delay_s = settings.loop_delay_s(), "loop delay changed");
            }
        }
    }
}

/// Feed a capture into the assembler in small bursts, one line per `line_delay`.
async fn replay_nmea(
    path: Option<PathBuf>,
    mut serial: SerialInput,
    line_delay: Duration,
) -> anyhow::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;

    for line in bytes.split_inclusive(|&b| b == b'\n') {
        for burst in line.chunks(SERIAL_BURST) {
            serial.feed(burst);
        }
        tokio::time::sleep(line_delay).await;
    }

    let stats = serial.stats();
    let filter = serial.handler().stats();
    info!(
        sentences = stats.sentences,
        truncated = stats.truncated_sentences,
        emitted = filter.emitted,
        throttled = filter.throttled,
        malformed = filter.malformed,
        "NMEA replay finished"
    );
    Ok(())
}

/// Inject every frame of a candump log, one per `frame_delay`.
async fn replay_candump(
    path: Option<PathBuf>,
    bus: Arc<VirtualBus>,
    frame_delay: Duration,
) -> anyhow::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let contents =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;

    let mut skipped = 0usize;
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        match CanFrame::from_candump(line) {
            Ok(frame) => {
                bus.inject(frame);
            }
            Err(e) => {
                warn!(error = %e, "skipping candump line");
                skipped += 1;
            }
        }
        tokio::time::sleep(frame_delay).await;
    }

    info!(
        delivered = bus.delivered(),
        dropped = bus.dropped(),
        skipped,
        "candump replay finished"
    );
    Ok(())
}

/// Apply a desired-state JSON document, logging each outcome.
fn apply_settings_file(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let desired: serde_json::Value = serde_json::from_str(&contents)?;
    for (key, outcome) in settings.apply_desired(&desired)? {
        if outcome.is_accepted() {
            debug!(key = %key, ?outcome, "desired setting applied");
        } else {
            warn!(key = %key, ?outcome, "desired setting rejected");
        }
    }
    Ok(())
}
