//! Runs the printer side of the MMU link against an emulated MMU over a pseudo-terminal
//!
//! Usage: `mmu_jig [settings.json]`. Set `RUST_LOG=debug` to see every frame.

mod clock;
mod device;
mod pty;
mod session;
mod settings;

use anyhow::{bail, Context, Result};
use clock::HostClock;
use device::Emulator;
use log::info;
use mmu_link::{FilamentState, ProtocolLogic, StepStatus};
use pty::{PtyTransport, SerialEmulator};
use session::Session;
use settings::Settings;
use std::{
    env, thread,
    time::{Duration, Instant},
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = match env::args_os().nth(1) {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let serial = SerialEmulator::new()?;
    info!("MMU emulated behind {}", serial.ttyname()?.display());

    let mut device = Emulator::new(&settings.device);
    let mut logic = ProtocolLogic::new(
        PtyTransport::new(serial.slave()),
        HostClock,
        settings.link.clone(),
    )
    .context("Invalid link configuration")?;
    logic.set_filament_state(FilamentState::NotPresent);
    logic.start();

    let mut session = Session::demo();
    let deadline = Instant::now() + Duration::from_millis(settings.session_timeout_ms);
    let mut rcvbuf: Vec<u8> = Vec::new();
    loop {
        rcvbuf.clear();
        pty::read_available(serial.master(), &mut rcvbuf)?;
        for frame in device.receive(&rcvbuf) {
            pty::write_all(serial.master(), frame.as_bytes())?;
        }

        let status = logic.step();
        if status != StepStatus::Processing {
            info!("{:?}/{:?}: {status:?}", logic.state(), logic.scope());
        }
        if session.advance(&mut logic, status)? {
            break;
        }

        if Instant::now() > deadline {
            bail!("Session did not complete in {}ms", settings.session_timeout_ms);
        }
        thread::sleep(Duration::from_millis(1));
    }

    if device.busy() {
        bail!("MMU still busy after the session");
    }
    if let Some(version) = logic.firmware_version() {
        info!("MMU firmware {version}");
    }
    info!(
        "Completed {} operations, {} command errors, filament state {} on the MMU",
        session.issued.len(),
        session.errors,
        device.filament()
    );
    Ok(())
}
