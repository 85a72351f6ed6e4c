// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-level SPI NOR command transport.
//!
//! Every command to a serial NOR part has the same shape on the wire: one
//! instruction byte, an optional 3- or 4-byte big-endian address, some dummy
//! cycles, and an optional payload, followed (for reads) by a receive phase
//! of known length. [`Command`] captures that shape and [`SpiNor`] drives it
//! over whatever [`SpiBus`] the board provides.
//!
//! The only liveness guarantee the secure-flash stack has against a wedged
//! part lives here: [`SpiNor::wait_ready`] polls the status register a fixed
//! number of times and then gives up with [`SpiNorError::DeviceBusy`].

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use ringbuf::{ringbuf, ringbuf_entry};

/// Standard instructions shared by all parts we talk to. Vendor packet
/// instructions live in the vendor's API crate.
pub mod instruction {
    /// JEDEC ID: manufacturer, memory type, capacity.
    pub const READ_ID: u8 = 0x9f;
    /// Read Status Register.
    pub const READ_STATUS: u8 = 0x05;
    /// Write Enable.
    pub const WRITE_ENABLE: u8 = 0x06;
    /// Read SFDP: 3-byte address and 8 dummy clocks.
    pub const READ_SFDP: u8 = 0x5a;
}

/// Status register: write in progress.
pub const STATUS_WIP: u8 = 1 << 0;
/// Status register: write enable latch.
pub const STATUS_WEL: u8 = 1 << 1;

/// Number of status polls before a busy part is reported as stuck.
pub const READY_POLL_LIMIT: u32 = 10_000;

/// Largest payload a single command may carry.
pub const MAX_PAYLOAD: usize = 640;

/// Instruction, widest address, and a dummy byte for fast reads.
const MAX_PREAMBLE: usize = 1 + 4 + 1;
const MAX_FRAME: usize = MAX_PREAMBLE + MAX_PAYLOAD;

/// Errors reported by a board's SPI controller.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
pub enum SpiError {
    Transfer = 1,
    ChipSelect,
}

/// Errors produced by the NOR command layer.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
pub enum SpiNorError {
    /// The controller failed to move the bytes.
    Transfer = 1,
    /// The part never cleared WIP within [`READY_POLL_LIMIT`] polls.
    DeviceBusy,
    /// WREN was sent but WEL did not latch.
    WriteEnableFailed,
    /// The command does not fit the frame buffer.
    FrameTooLarge,
    /// A 3-byte address was asked to carry more than 24 bits.
    AddressOutOfRange,
}

impl From<SpiError> for SpiNorError {
    fn from(_: SpiError) -> Self {
        SpiNorError::Transfer
    }
}

/// A full-duplex-ish SPI controller with a single chip select.
pub trait SpiBus {
    /// Asserts chip select, clocks out all of `tx`, clocks in `rx.len()`
    /// bytes, then releases chip select.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), SpiError>;
}

impl<T: SpiBus + ?Sized> SpiBus for &mut T {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), SpiError> {
        (**self).transfer(tx, rx)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Address {
    ThreeByte(u32),
    FourByte(u32),
}

impl Address {
    fn encode(self, out: &mut [u8]) -> Result<usize, SpiNorError> {
        match self {
            Address::ThreeByte(a) => {
                if a > 0x00ff_ffff {
                    return Err(SpiNorError::AddressOutOfRange);
                }
                out[..3].copy_from_slice(&a.to_be_bytes()[1..]);
                Ok(3)
            }
            Address::FourByte(a) => {
                out[..4].copy_from_slice(&a.to_be_bytes());
                Ok(4)
            }
        }
    }
}

/// One command frame.
#[derive(Copy, Clone, Debug)]
pub struct Command<'a> {
    pub instruction: u8,
    pub address: Option<Address>,
    pub dummy: u8,
    pub payload: &'a [u8],
}

impl<'a> Command<'a> {
    pub const fn new(instruction: u8) -> Self {
        Self {
            instruction,
            address: None,
            dummy: 0,
            payload: &[],
        }
    }

    pub const fn with_address(self, address: Address) -> Self {
        Self {
            address: Some(address),
            ..self
        }
    }

    pub const fn with_dummy(self, dummy: u8) -> Self {
        Self { dummy, ..self }
    }

    pub const fn with_payload(self, payload: &'a [u8]) -> Self {
        Self { payload, ..self }
    }

    /// Serializes the frame into `buf`, returning its length.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, SpiNorError> {
        let addr_len = match self.address {
            None => 0,
            Some(Address::ThreeByte(_)) => 3,
            Some(Address::FourByte(_)) => 4,
        };
        let total =
            1 + addr_len + usize::from(self.dummy) + self.payload.len();
        if total > buf.len() {
            return Err(SpiNorError::FrameTooLarge);
        }

        buf[0] = self.instruction;
        let mut n = 1;
        if let Some(a) = self.address {
            n += a.encode(&mut buf[n..])?;
        }
        buf[n..][..usize::from(self.dummy)].fill(0);
        n += usize::from(self.dummy);
        buf[n..][..self.payload.len()].copy_from_slice(self.payload);
        n += self.payload.len();
        Ok(n)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    WriteEnableStatus(u8),
    BusyTimeout,
    TransferFailed(u8),
    None,
}

ringbuf!(Trace, 16, Trace::None);

/// A NOR part on a [`SpiBus`], with its own frame buffer.
pub struct SpiNor<B> {
    bus: B,
    frame: [u8; MAX_FRAME],
}

impl<B: SpiBus> SpiNor<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            frame: [0; MAX_FRAME],
        }
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Sends a command with no receive phase.
    pub fn send(&mut self, cmd: &Command<'_>) -> Result<(), SpiNorError> {
        self.receive(cmd, &mut [])
    }

    /// Sends a command and then clocks in `rx.len()` bytes.
    pub fn receive(
        &mut self,
        cmd: &Command<'_>,
        rx: &mut [u8],
    ) -> Result<(), SpiNorError> {
        let n = cmd.encode(&mut self.frame)?;
        self.bus.transfer(&self.frame[..n], rx).map_err(|e| {
            ringbuf_entry!(Trace::TransferFailed(cmd.instruction));
            SpiNorError::from(e)
        })
    }

    pub fn read_id(&mut self) -> Result<[u8; 3], SpiNorError> {
        let mut id = [0; 3];
        self.receive(&Command::new(instruction::READ_ID), &mut id)?;
        Ok(id)
    }

    pub fn read_status(&mut self) -> Result<u8, SpiNorError> {
        let mut status = [0; 1];
        self.receive(&Command::new(instruction::READ_STATUS), &mut status)?;
        Ok(status[0])
    }

    /// Issues WREN and checks that the latch took.
    pub fn write_enable(&mut self) -> Result<(), SpiNorError> {
        self.send(&Command::new(instruction::WRITE_ENABLE))?;
        let status = self.read_status()?;
        ringbuf_entry!(Trace::WriteEnableStatus(status));
        if status & STATUS_WEL == 0 {
            return Err(SpiNorError::WriteEnableFailed);
        }
        Ok(())
    }

    /// Polls until WIP clears, at most [`READY_POLL_LIMIT`] times.
    pub fn wait_ready(&mut self) -> Result<(), SpiNorError> {
        for _ in 0..READY_POLL_LIMIT {
            if self.read_status()? & STATUS_WIP == 0 {
                return Ok(());
            }
        }
        ringbuf_entry!(Trace::BusyTimeout);
        Err(SpiNorError::DeviceBusy)
    }

    pub fn read_sfdp(
        &mut self,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), SpiNorError> {
        let cmd = Command::new(instruction::READ_SFDP)
            .with_address(Address::ThreeByte(addr))
            .with_dummy(1);
        self.receive(&cmd, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every frame and answers status reads from a script.
    #[derive(Default)]
    struct Recorder {
        frames: Vec<Vec<u8>>,
        busy_polls: u32,
        wel: bool,
        fail: bool,
    }

    impl SpiBus for Recorder {
        fn transfer(
            &mut self,
            tx: &[u8],
            rx: &mut [u8],
        ) -> Result<(), SpiError> {
            if self.fail {
                return Err(SpiError::Transfer);
            }
            self.frames.push(tx.to_vec());
            match tx[0] {
                instruction::WRITE_ENABLE => self.wel = true,
                instruction::READ_STATUS => {
                    let mut s = 0;
                    if self.busy_polls > 0 {
                        self.busy_polls -= 1;
                        s |= STATUS_WIP;
                    }
                    if self.wel {
                        s |= STATUS_WEL;
                    }
                    rx[0] = s;
                }
                instruction::READ_ID => rx.copy_from_slice(&[0xc2, 0x29, 0x17]),
                _ => rx.fill(0xa5),
            }
            Ok(())
        }
    }

    #[test]
    fn encodes_address_dummy_and_payload() {
        let mut buf = [0; 16];
        let cmd = Command::new(0x34)
            .with_address(Address::ThreeByte(0x12_3456))
            .with_dummy(2)
            .with_payload(&[0xaa, 0xbb]);
        let n = cmd.encode(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x34, 0x12, 0x34, 0x56, 0, 0, 0xaa, 0xbb]);

        let cmd =
            Command::new(0x13).with_address(Address::FourByte(0x0102_0304));
        let n = cmd.encode(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x13, 1, 2, 3, 4]);
    }

    #[test]
    fn oversize_frame_is_refused() {
        let big = [0u8; 20];
        let mut buf = [0; 16];
        assert_eq!(
            Command::new(0x02).with_payload(&big).encode(&mut buf),
            Err(SpiNorError::FrameTooLarge)
        );
        assert_eq!(
            Command::new(0x03)
                .with_address(Address::ThreeByte(0x0100_0000))
                .encode(&mut buf),
            Err(SpiNorError::AddressOutOfRange)
        );
    }

    #[test]
    fn write_enable_checks_latch() {
        let mut nor = SpiNor::new(Recorder::default());
        nor.write_enable().unwrap();
        assert_eq!(nor.bus_mut().frames[0], vec![instruction::WRITE_ENABLE]);
    }

    #[test]
    fn write_enable_without_latch_fails() {
        struct Deaf;
        impl SpiBus for Deaf {
            fn transfer(
                &mut self,
                _tx: &[u8],
                rx: &mut [u8],
            ) -> Result<(), SpiError> {
                rx.fill(0);
                Ok(())
            }
        }
        let mut nor = SpiNor::new(Deaf);
        assert_eq!(nor.write_enable(), Err(SpiNorError::WriteEnableFailed));
    }

    #[test]
    fn wait_ready_tolerates_short_busy() {
        let mut nor = SpiNor::new(Recorder {
            busy_polls: 50,
            ..Default::default()
        });
        nor.wait_ready().unwrap();
        assert_eq!(nor.bus_mut().frames.len(), 51);
    }

    #[test]
    fn wait_ready_gives_up_after_limit() {
        let mut nor = SpiNor::new(Recorder {
            busy_polls: u32::MAX,
            ..Default::default()
        });
        assert_eq!(nor.wait_ready(), Err(SpiNorError::DeviceBusy));
        assert_eq!(nor.bus_mut().frames.len(), READY_POLL_LIMIT as usize);
    }

    #[test]
    fn sfdp_read_uses_one_dummy_byte() {
        let mut nor = SpiNor::new(Recorder::default());
        let mut buf = [0; 4];
        nor.read_sfdp(0x10, &mut buf).unwrap();
        assert_eq!(nor.bus_mut().frames[0], vec![0x5a, 0, 0, 0x10, 0]);
        assert_eq!(buf, [0xa5; 4]);
        assert_eq!(nor.read_id().unwrap(), [0xc2, 0x29, 0x17]);
    }

    #[test]
    fn bus_failure_is_transfer_error() {
        let mut nor = SpiNor::new(Recorder {
            fail: true,
            ..Default::default()
        });
        assert_eq!(nor.read_status(), Err(SpiNorError::Transfer));
    }
}
