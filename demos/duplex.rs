//! Duplex backend demo.
//!
//! Initializes the cpal-backed subsystem, prints the device lists and the
//! negotiated output format, then plays a sine test tone for a few seconds
//! while capture (if started successfully) feeds the capture ring.

use std::sync::Arc;

use anyhow::Result;
use duplex_audio::{AudioDriver, Mixer, NativeSubsystem};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Renders a 440 Hz sine at the negotiated rate and channel count.
struct ToneMixer {
    phase: f32,
    sample_rate: f32,
    channels: usize,
}

impl Mixer for ToneMixer {
    fn render(&mut self, frames: usize, out: &mut [i32]) {
        let step = 440.0 * std::f32::consts::TAU / self.sample_rate;
        for frame in out.chunks_mut(self.channels).take(frames) {
            let sample = (self.phase.sin() * 0.2 * i32::MAX as f32) as i32;
            self.phase = (self.phase + step) % std::f32::consts::TAU;
            frame.fill(sample);
        }
    }

    fn captured(&mut self, frames: usize) {
        tracing::debug!("Captured {} frames", frames);
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let subsystem = Arc::new(NativeSubsystem::new());
    // The mixer is rebuilt below once the real rate is known; start from a
    // common default so the first callbacks are well-formed either way.
    let driver = AudioDriver::new(
        subsystem,
        Box::new(ToneMixer {
            phase: 0.0,
            sample_rate: 48000.0,
            channels: 2,
        }),
    );

    driver.init()?;
    info!("Backend: {}", driver.name());
    info!("Output devices: {:?}", driver.output_devices());
    info!("Input devices: {:?}", driver.input_devices());
    info!(
        "Negotiated: {} Hz, {:?}",
        driver.mix_rate(),
        driver.speaker_mode()
    );

    driver.start()?;
    if let Err(e) = driver.input_start() {
        warn!("Capture unavailable: {}", e);
    }

    std::thread::sleep(std::time::Duration::from_secs(3));

    driver.finish();
    info!("Done");
    Ok(())
}
