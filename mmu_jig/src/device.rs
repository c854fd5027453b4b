//! Emulated MMU answering requests the way the device firmware does

use crate::settings::DeviceSettings;
use log::{debug, info};
use mmu_link::{
    encode_response, Frame, ParamCode, RequestCode, RequestDecoder, RequestMsg, ResponseMsg,
};
use std::collections::BTreeMap;

pub const REG_FINDA: u8 = 0x08;
pub const REG_ACTIVE_SLOT: u8 = 0x1b;
pub const REG_ERROR_COUNT: u8 = 0x04;

/// Registers the emulator answers reads for, with their power-on values
const REGISTERS: [(u8, u16); 7] = [
    (REG_ERROR_COUNT, 0),
    (REG_FINDA, 0),
    (0x0b, 0),
    (0x14, 0),
    (0x1a, 0),
    (REG_ACTIVE_SLOT, 5),
    (0x1c, 5),
];

#[derive(Debug)]
struct Activity {
    command: RequestMsg,
    remaining: u8,
    error: Option<u16>,
}

pub struct Emulator {
    decoder: RequestDecoder,
    firmware: [u16; 4],
    progress_steps: u8,
    load_error: Option<u16>,
    registers: BTreeMap<u8, u16>,
    active: Option<Activity>,
    last_command: RequestMsg,
    filament: u16,
}

impl Emulator {
    pub fn new(settings: &DeviceSettings) -> Self {
        Emulator {
            decoder: RequestDecoder::new(),
            firmware: settings.firmware,
            progress_steps: settings.progress_steps,
            load_error: settings.load_error,
            registers: REGISTERS.into_iter().collect(),
            active: None,
            last_command: RequestMsg::new(RequestCode::Reset, 0),
            filament: 0,
        }
    }

    /// Feeds bytes received from the printer, returning the frames to send back
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        for &b in bytes {
            match self.decoder.decode_byte(b) {
                Ok(Some(req)) => {
                    let rsp = self.respond(req);
                    debug!("device: {req} -> {rsp}");
                    out.push(encode_response(&rsp));
                }
                Ok(None) => {}
                Err(e) => debug!("device: dropping request ({e})"),
            }
        }
        out
    }

    pub fn register(&self, address: u8) -> Option<u16> {
        self.registers.get(&address).copied()
    }

    pub fn filament(&self) -> u16 {
        self.filament
    }

    pub fn busy(&self) -> bool {
        self.active.is_some()
    }

    fn respond(&mut self, req: RequestMsg) -> ResponseMsg {
        use ParamCode::*;

        match req.code {
            RequestCode::Query => self.status(),
            code if code.is_command() => {
                if self.active.is_some() {
                    return ResponseMsg::new(req, Rejected, 0);
                }
                let error = match code {
                    RequestCode::Load => self.load_error,
                    _ => None,
                };
                info!("device: starting {req}");
                self.active = Some(Activity {
                    command: req,
                    remaining: self.progress_steps,
                    error,
                });
                ResponseMsg::new(req, Accepted, 0)
            }
            RequestCode::Button => {
                if let Some(activity) = &mut self.active {
                    if activity.error.take().is_some() {
                        info!("device: error cleared by button {}", req.value);
                    }
                }
                ResponseMsg::new(req, Accepted, 0)
            }
            RequestCode::Version => match self.firmware.get(usize::from(req.value)) {
                Some(&v) => ResponseMsg::new(req, Accepted, u32::from(v)),
                None => ResponseMsg::new(req, Rejected, 0),
            },
            RequestCode::Read => match self.registers.get(&(req.value as u8)) {
                Some(&v) => ResponseMsg::new(req, Accepted, u32::from(v)),
                None => ResponseMsg::new(req, Rejected, 0),
            },
            RequestCode::Write => match req.value2 {
                Some(v) if self.registers.contains_key(&(req.value as u8)) => {
                    self.registers.insert(req.value as u8, v);
                    ResponseMsg::new(req, Accepted, 0)
                }
                _ => ResponseMsg::new(req, Rejected, 0),
            },
            RequestCode::FilamentSensor => {
                self.filament = req.value;
                ResponseMsg::new(req, Accepted, 0)
            }
            RequestCode::Finda => {
                let finda = self.registers.get(&REG_FINDA).copied().unwrap_or(0);
                ResponseMsg::new(req, Accepted, u32::from(finda))
            }
            _ => ResponseMsg::new(req, Accepted, 0),
        }
    }

    /// Answers a query with the state of the current or last command
    fn status(&mut self) -> ResponseMsg {
        let Some(activity) = &mut self.active else {
            return ResponseMsg::new(self.last_command, ParamCode::Finished, 0);
        };
        let command = activity.command;
        if let Some(code) = activity.error {
            *self.registers.entry(REG_ERROR_COUNT).or_default() += 1;
            return ResponseMsg::new(command, ParamCode::Error, u32::from(code));
        }
        if activity.remaining > 0 {
            let progress = self.progress_steps - activity.remaining + 1;
            activity.remaining -= 1;
            return ResponseMsg::new(command, ParamCode::Processing, u32::from(progress));
        }

        self.active = None;
        self.complete(command);
        ResponseMsg::new(command, ParamCode::Finished, 0)
    }

    fn complete(&mut self, command: RequestMsg) {
        match command.code {
            RequestCode::Tool | RequestCode::Load => {
                self.registers.insert(REG_ACTIVE_SLOT, command.value);
                self.registers.insert(REG_FINDA, 1);
            }
            RequestCode::Unload | RequestCode::Eject => {
                self.registers.insert(REG_FINDA, 0);
            }
            _ => {}
        }
        info!("device: finished {command}");
        self.last_command = command;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmu_link::ResponseDecoder;

    fn settings() -> DeviceSettings {
        DeviceSettings {
            firmware: [3, 0, 3, 700],
            progress_steps: 2,
            load_error: Some(0x8087),
        }
    }

    fn exchange(device: &mut Emulator, payload: &str) -> Vec<String> {
        let frame = Frame::sealed(payload);
        let mut decoder = ResponseDecoder::new();
        let mut out = Vec::new();
        for frame in device.receive(frame.as_bytes()) {
            for &b in frame.as_bytes() {
                if let Some(rsp) = decoder.decode_byte(b).unwrap() {
                    out.push(rsp.to_string());
                }
            }
        }
        out
    }

    #[test]
    fn reports_version_stages() {
        let mut device = Emulator::new(&settings());
        assert_eq!(exchange(&mut device, "S0"), ["S0 A3"]);
        assert_eq!(exchange(&mut device, "S2"), ["S2 A3"]);
        assert_eq!(exchange(&mut device, "S3"), ["S3 A2bc"]);
        assert_eq!(exchange(&mut device, "S4"), ["S4 R0"]);
    }

    #[test]
    fn idle_query_reports_last_command() {
        let mut device = Emulator::new(&settings());
        assert_eq!(exchange(&mut device, "Q0"), ["X0 F0"]);
    }

    #[test]
    fn tool_change_lifecycle() {
        let mut device = Emulator::new(&settings());
        assert_eq!(exchange(&mut device, "T2"), ["T2 A0"]);
        assert!(device.busy());
        assert_eq!(exchange(&mut device, "T1"), ["T1 R0"]);
        assert_eq!(exchange(&mut device, "Q0"), ["T2 P1"]);
        assert_eq!(exchange(&mut device, "Q0"), ["T2 P2"]);
        assert_eq!(exchange(&mut device, "Q0"), ["T2 F0"]);
        assert!(!device.busy());
        assert_eq!(device.register(REG_ACTIVE_SLOT), Some(2));
        assert_eq!(device.register(REG_FINDA), Some(1));
        assert_eq!(exchange(&mut device, "Q0"), ["T2 F0"]);
        assert_eq!(exchange(&mut device, "R1b"), ["R1b A2"]);
    }

    #[test]
    fn load_error_needs_button() {
        let mut device = Emulator::new(&settings());
        assert_eq!(exchange(&mut device, "L1"), ["L1 A0"]);
        assert_eq!(exchange(&mut device, "Q0"), ["L1 E8087"]);
        assert_eq!(exchange(&mut device, "Q0"), ["L1 E8087"]);
        assert_eq!(device.register(REG_ERROR_COUNT), Some(2));
        assert_eq!(exchange(&mut device, "B0"), ["B0 A0"]);
        assert_eq!(exchange(&mut device, "Q0"), ["L1 P1"]);
    }

    #[test]
    fn registers_and_sensor() {
        let mut device = Emulator::new(&settings());
        assert_eq!(exchange(&mut device, "W14 28"), ["W14 A0"]);
        assert_eq!(exchange(&mut device, "R14"), ["R14 A28"]);
        assert_eq!(exchange(&mut device, "W99 1"), ["W99 R0"]);
        assert_eq!(exchange(&mut device, "R99"), ["R99 R0"]);
        assert_eq!(exchange(&mut device, "f2"), ["f2 A0"]);
        assert_eq!(device.filament(), 2);
    }

    #[test]
    fn ignores_corrupted_requests() {
        let mut device = Emulator::new(&settings());
        assert!(device.receive(b"Q0*00\n").is_empty());
        assert!(device.receive(b"garbage\n").is_empty());
        assert_eq!(exchange(&mut device, "Q0"), ["X0 F0"]);
    }
}
