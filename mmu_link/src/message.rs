use core::fmt;

/// Message family of a request, sent as the first character of every frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCode {
    Query = b'Q',
    Tool = b'T',
    Load = b'L',
    Mode = b'M',
    Unload = b'U',
    Reset = b'X',
    Finda = b'P',
    Version = b'S',
    Button = b'B',
    Eject = b'E',
    Write = b'W',
    Cut = b'K',
    FilamentType = b'F',
    FilamentSensor = b'f',
    Home = b'H',
    Read = b'R',
}

impl RequestCode {
    /// Codes the device treats as long running operations
    ///
    /// These go through accept, query and finish; everything else is answered immediately.
    pub fn is_command(self) -> bool {
        matches!(
            self,
            RequestCode::Tool
                | RequestCode::Load
                | RequestCode::Mode
                | RequestCode::Unload
                | RequestCode::Reset
                | RequestCode::Eject
                | RequestCode::Cut
                | RequestCode::Home
        )
    }

    pub fn as_char(self) -> char {
        self as u8 as char
    }
}

impl TryFrom<u8> for RequestCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            b'Q' => RequestCode::Query,
            b'T' => RequestCode::Tool,
            b'L' => RequestCode::Load,
            b'M' => RequestCode::Mode,
            b'U' => RequestCode::Unload,
            b'X' => RequestCode::Reset,
            b'P' => RequestCode::Finda,
            b'S' => RequestCode::Version,
            b'B' => RequestCode::Button,
            b'E' => RequestCode::Eject,
            b'W' => RequestCode::Write,
            b'K' => RequestCode::Cut,
            b'F' => RequestCode::FilamentType,
            b'f' => RequestCode::FilamentSensor,
            b'H' => RequestCode::Home,
            b'R' => RequestCode::Read,
            other => return Err(other),
        })
    }
}

/// A single request towards the MMU
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequestMsg {
    pub code: RequestCode,
    pub value: u16,
    /// Only present for register writes
    pub value2: Option<u16>,
}

impl RequestMsg {
    pub const fn new(code: RequestCode, value: u16) -> Self {
        Self {
            code,
            value,
            value2: None,
        }
    }

    pub const fn write(address: u8, value: u16) -> Self {
        Self {
            code: RequestCode::Write,
            value: address as u16,
            value2: Some(value),
        }
    }

    /// Whether `rsp` echoes this request
    pub fn matches(&self, rsp: &ResponseMsg) -> bool {
        self.code == rsp.code && self.value == rsp.value
    }
}

impl fmt::Display for RequestMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:x}", self.code.as_char(), self.value)?;
        if let Some(v) = self.value2 {
            write!(f, " {v:x}")?;
        }
        Ok(())
    }
}

/// Parameter token of a response
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamCode {
    Accepted = b'A',
    Rejected = b'R',
    Finished = b'F',
    Processing = b'P',
    Error = b'E',
    Button = b'B',
}

impl ParamCode {
    pub fn as_char(self) -> char {
        self as u8 as char
    }
}

impl TryFrom<u8> for ParamCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            b'A' => ParamCode::Accepted,
            b'R' => ParamCode::Rejected,
            b'F' => ParamCode::Finished,
            b'P' => ParamCode::Processing,
            b'E' => ParamCode::Error,
            b'B' => ParamCode::Button,
            other => return Err(other),
        })
    }
}

/// A decoded response from the MMU
///
/// `code` and `value` echo the request the device is answering. A missing parameter value on the
/// wire decodes as zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResponseMsg {
    pub code: RequestCode,
    pub value: u16,
    pub param: ParamCode,
    pub param_value: u32,
}

impl ResponseMsg {
    pub const fn new(request: RequestMsg, param: ParamCode, param_value: u32) -> Self {
        Self {
            code: request.code,
            value: request.value,
            param,
            param_value,
        }
    }

    /// The request this response answers, without any write value
    pub const fn request(&self) -> RequestMsg {
        RequestMsg::new(self.code, self.value)
    }
}

impl fmt::Display for ResponseMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:x} {}{:x}",
            self.code.as_char(),
            self.value,
            self.param.as_char(),
            self.param_value
        )
    }
}

/// Where the printer's filament sensor sees the filament
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FilamentState {
    #[default]
    NotPresent = 0,
    AtFsensor = 1,
    InNozzle = 2,
    Unavailable = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_roundtrip_through_bytes() {
        for b in b"QTLMUXPSBEWKFfHR" {
            let code = RequestCode::try_from(*b).unwrap();
            assert_eq!(code as u8, *b);
        }
        assert_eq!(RequestCode::try_from(b'Z'), Err(b'Z'));
    }

    #[test]
    fn command_classification() {
        assert!(RequestCode::Tool.is_command());
        assert!(RequestCode::Reset.is_command());
        assert!(!RequestCode::Button.is_command());
        assert!(!RequestCode::Read.is_command());
        assert!(!RequestCode::Query.is_command());
    }

    #[test]
    fn display_renders_wire_text() {
        assert_eq!(RequestMsg::new(RequestCode::Read, 0x1b).to_string(), "R1b");
        assert_eq!(RequestMsg::write(9, 10).to_string(), "W9 a");
        let rsp = ResponseMsg::new(
            RequestMsg::new(RequestCode::Tool, 1),
            ParamCode::Error,
            0x8087,
        );
        assert_eq!(rsp.to_string(), "T1 E8087");
    }
}
