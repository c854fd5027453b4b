//! `mmu_link` implements the printer side of the serial protocol spoken by multi-material units
//!
//! The MMU is attached over a half-duplex UART with no flow control and no delivery guarantees,
//! and it may reset at any time. This crate keeps the link alive: it negotiates the firmware
//! version, sends commands and tracks them to completion, polls status registers, and recovers
//! from noise and silence without ever blocking the caller.
//!
//! The crate is `no_std` and allocation free. Enable the `std` feature for `std::error::Error`
//! implementations and the `serde` feature to deserialize a [`Config`].
//!
//! To get started, provide the two capabilities the link needs: a non-blocking byte
//! [`Transport`] and a millisecond [`Clock`]. A UART with a receive FIFO could look like:
//!
//! ```ignore
//! struct Uart<'a> {
//!     rx: &'a RefCell<FifoBuffer<64>>,
//! }
//!
//! impl Transport for Uart<'_> {
//!     fn receive(&mut self) -> Option<u8> {
//!         self.rx.borrow_mut().pop()
//!     }
//!
//!     fn transmit(&mut self, frame: &[u8]) {
//!         uart_write(frame);
//!     }
//! }
//! ```
//!
//! With those in place, create a [`ProtocolLogic`], start it and call [`ProtocolLogic::step`] from
//! the main loop:
//!
//! ```ignore
//! let mut mmu = ProtocolLogic::new(uart, clock, Config::default())?;
//! mmu.start();
//! loop {
//!     match mmu.step() {
//!         StepStatus::Finished => { /* command done */ }
//!         StepStatus::CommandError => handle_error(mmu.error_code()),
//!         _ => {}
//!     }
//!     if let Some(slot) = next_tool_change() {
//!         mmu.issue_tool_change(slot)?;
//!     }
//! }
//! ```
//!
//! `step` must be called well within the link-layer timeout (two seconds by default) or the
//! link will consider the MMU lost.
//!
//! The wire format is described in [`frame`]. The device side of the codec ([`RequestDecoder`]
//! and [`encode_response`]) is exported as well, which allows emulating an MMU for testing.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod config;
pub mod crc;
pub mod frame;
pub mod logic;
pub mod message;
pub mod registers;

mod dropout;
mod link;

pub use config::{
    Config, ConfigBuilder, ConfigError, ErrorEscalation, SetupWrite, SupportedVersion,
};
pub use dropout::DropoutFilter;
pub use frame::{
    encode_request, encode_response, DecodeError, Frame, RequestDecoder, ResponseDecoder,
};
pub use link::{Clock, Instant, Transport};
pub use logic::{
    Command, FirmwareVersion, ProtocolLogic, ProtocolState, RequestError, Scope, StepStatus,
};
pub use message::{FilamentState, ParamCode, RequestCode, RequestMsg, ResponseMsg};
pub use registers::{PollCursor, PollEntry, RegisterPoll, RegisterWidth};
