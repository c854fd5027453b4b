use anyhow::{bail, Result};
use log::{info, warn};
use mmu_link::{
    Clock, Command, ProtocolLogic, RequestError, RegisterWidth, Scope, StepStatus, Transport,
};
use std::collections::VecDeque;

/// One scripted operation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    /// A tool change with a second one queued right behind it
    ToolChanges(u8, u8),
    Command(Command),
    Read(u8),
    Write(u8, u16),
}

/// Feeds a fixed script of operations to the protocol logic, one after the other
///
/// Each operation is issued once the link is idle and the previous one has finished. A command
/// that reports an error is retried by pressing the middle button.
pub struct Session {
    script: VecDeque<Action>,
    outstanding: usize,
    retry_pressed: bool,
    pub issued: Vec<Action>,
    pub errors: usize,
}

impl Session {
    pub fn new(script: impl IntoIterator<Item = Action>) -> Self {
        Session {
            script: script.into_iter().collect(),
            outstanding: 0,
            retry_pressed: false,
            issued: Vec::new(),
            errors: 0,
        }
    }

    pub fn demo() -> Self {
        Session::new([
            Action::ToolChanges(1, 2),
            Action::Read(0x1b),
            Action::Write(0x0b, 40),
            Action::Command(Command::Load(3)),
            Action::Command(Command::Unload),
        ])
    }

    /// Reacts to the result of one step, returning `true` once the script has completed
    pub fn advance<T: Transport, C: Clock>(
        &mut self,
        logic: &mut ProtocolLogic<T, C>,
        status: StepStatus,
    ) -> Result<bool> {
        match status {
            StepStatus::Finished | StepStatus::Interrupted if self.outstanding > 0 => {
                self.outstanding -= 1;
                self.retry_pressed = false;
                if self.outstanding == 0 {
                    self.report(logic);
                }
            }
            StepStatus::CommandError => {
                self.errors += 1;
                warn!("MMU error {:#x}", logic.error_code());
                if !self.retry_pressed {
                    match logic.issue_button(1) {
                        Ok(()) | Err(RequestError::Busy) => self.retry_pressed = true,
                        Err(e) => bail!("Could not press retry: {e}"),
                    }
                }
            }
            StepStatus::VersionMismatch => bail!("MMU firmware is not supported"),
            StepStatus::CommunicationTimeout | StepStatus::ProtocolError => {
                bail!("Link to the MMU failed: {status:?}")
            }
            _ => {}
        }

        // An idle pass only finishes once the link is free again
        if status == StepStatus::Finished && self.outstanding == 0 && logic.scope() == Scope::Idle {
            let Some(action) = self.script.pop_front() else {
                return Ok(true);
            };
            info!("session: {action:?}");
            self.issue(logic, action)?;
            self.issued.push(action);
        }
        Ok(false)
    }

    fn issue<T: Transport, C: Clock>(
        &mut self,
        logic: &mut ProtocolLogic<T, C>,
        action: Action,
    ) -> Result<()> {
        let issued = match action {
            Action::ToolChanges(first, second) => {
                logic.issue_tool_change(first)?;
                logic.issue_tool_change(second)?;
                2
            }
            Action::Command(command) => {
                logic.issue_command(command)?;
                1
            }
            Action::Read(address) => {
                logic.read_register(address)?;
                1
            }
            Action::Write(address, value) => {
                logic.write_register(address, value)?;
                1
            }
        };
        self.outstanding = issued;
        Ok(())
    }

    fn report<T: Transport, C: Clock>(&self, logic: &ProtocolLogic<T, C>) {
        if let Some(value) = logic.read_value() {
            info!("session: register read returned {value}");
        }
        if let Some(slot) = logic.register_value(RegisterWidth::Narrow, 0x1b) {
            info!("session: active slot {slot}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Emulator, REG_ACTIVE_SLOT, REG_FINDA};
    use crate::settings::{DeviceSettings, Settings};
    use mmu_link::{FilamentState, Instant};
    use std::{cell::Cell, collections::VecDeque, rc::Rc};

    /// Wires the protocol logic straight into the emulator
    struct Loopback {
        device: Emulator,
        rx: VecDeque<u8>,
    }

    impl Transport for Loopback {
        fn receive(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn transmit(&mut self, frame: &[u8]) {
            for rsp in self.device.receive(frame) {
                self.rx.extend(rsp.as_bytes());
            }
        }
    }

    #[derive(Clone)]
    struct StepClock(Rc<Cell<u32>>);

    impl Clock for StepClock {
        fn now(&self) -> Instant {
            Instant::from_millis(self.0.get())
        }
    }

    fn run(session: &mut Session, device: DeviceSettings) -> ProtocolLogic<Loopback, StepClock> {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::max())
            .is_test(true)
            .try_init();

        let settings = Settings::default();
        let clock = StepClock(Rc::new(Cell::new(0)));
        let loopback = Loopback {
            device: Emulator::new(&device),
            rx: VecDeque::new(),
        };
        let mut logic = ProtocolLogic::new(loopback, clock.clone(), settings.link).unwrap();
        logic.set_filament_state(FilamentState::AtFsensor);
        logic.start();

        for _ in 0..100_000 {
            let status = logic.step();
            if session.advance(&mut logic, status).unwrap() {
                return logic;
            }
            clock.0.set(clock.0.get().wrapping_add(10));
        }
        panic!("session did not complete");
    }

    #[test]
    fn demo_script_completes() {
        let mut session = Session::demo();
        let logic = run(&mut session, DeviceSettings::default());
        let device = &logic.transport().device;
        assert_eq!(session.issued.len(), 5);
        assert!(session.errors >= 1);
        assert_eq!(logic.read_value(), Some(2));
        assert_eq!(device.register(REG_ACTIVE_SLOT), Some(3));
        assert_eq!(device.register(REG_FINDA), Some(0));
        assert_eq!(device.register(0x0b), Some(40));
        assert_eq!(device.filament(), FilamentState::AtFsensor as u16);
    }

    #[test]
    fn queued_tool_change_runs_second() {
        let mut session = Session::new([Action::ToolChanges(4, 0)]);
        let device = DeviceSettings {
            load_error: None,
            ..DeviceSettings::default()
        };
        let logic = run(&mut session, device);
        assert_eq!(session.errors, 0);
        assert_eq!(logic.transport().device.register(REG_ACTIVE_SLOT), Some(0));
    }
}
