// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Based on the previous work of cc2538-bsl and Texas Instruments sblAppEx
// 1.03.00.00 (swra466c.zip).
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # CC26x0 Serial Bootloader driver
//!
//! Host-side implementation of the serial interface of the CC26x0 ROM
//! bootloader: packet framing with ACK/NAK handshake, the device command
//! set (ping, reset, memory read/write, flash erase/program/CRC, chip
//! identification), and the chunking required by the bootloader's small
//! per-command transfer limits.
//!
//! The serial transport is any [`serial::SerialPort`]; this crate never
//! opens or configures ports itself beyond the [`port_settings`] helper.
//!
//! # See also
//!
//! - [CC2538/CC26x0/CC26x2 Serial Bootloader Interface](https://www.ti.com/lit/an/swra466c/swra466c.pdf).

use std::{fmt, io};

use serial::SerialPort;

#[rustfmt::skip]
pub mod constants;
pub mod memmap;
pub mod util;

mod error;
mod notify;
mod revision;

pub use self::error::{Error, Result};
pub use self::notify::{Notifier, NullNotifier};
pub use self::revision::{Command, Revision};

use self::constants::{
    ACCESS_WIDTH_32B, ACCESS_WIDTH_8B, BL_CONFIG_ENABLED_BM,
    BL_CONFIG_PAGE_OFFSET, COMMAND_RET_SUCCESS, MAX_BYTES_PER_TRANSFER,
    MAX_MEMREAD_BYTES, MAX_MEMREAD_WORDS, MAX_MEMWRITE_BYTES,
    MAX_MEMWRITE_WORDS, PAGE_ERASE_SIZE,
};
use self::util::{
    bytes_to_u32, chunk_count, chunks, command_checksum, response_checksum,
    u32_to_bytes,
};

// ACK retry budgets. Memory writes and CRC32 trigger device-side work that
// takes longer than a plain echo, so they get extra response attempts.
const MEMWRITE_ACK_RETRIES: u32 = 5;
const CRC32_ACK_RETRIES: u32 = 5;
const SEND_DATA_ACK_RETRIES: u32 = 3;

/// One physical segment of a flash write. A write that touches the
/// bootloader-lock configuration byte is split in two; the segment
/// carrying the lock byte must not wait for a response, because the
/// device may stop answering as soon as its bootloader is disabled.
#[derive(Debug, Clone, Copy)]
struct Transfer {
    start_address: u32,
    byte_count: u32,
    start_offset: u32,
    expect_ack: bool,
}

/// A CC26x0 device session over the Serial Bootloader Interface (SBL).
///
/// Owns the transport for its whole lifetime and keeps the per-connection
/// state: detected device ID and revision, flash/RAM geometry and whether
/// the bootloader link is still established. [`Device::detect_auto_baud`]
/// must succeed before any other command is issued.
pub struct Device<P> {
    port: P,
    notifier: Box<dyn Notifier>,
    device_id: Option<u32>,
    revision: Option<Revision>,
    flash_size: Option<u32>,
    ram_size: Option<u32>,
    flash_base: u32,
    link_initialized: bool,
}

impl<P> Device<P>
where
    P: SerialPort,
{
    /// Create a new `Device` from an already opened and configured port.
    ///
    /// # Note
    ///
    /// This function expects the device to already be in bootloader mode.
    /// Call [`Device::detect_auto_baud`] to synchronize the link before
    /// issuing any command.
    pub fn new(port: P) -> Self {
        Device::with_notifier(port, Box::new(NullNotifier))
    }

    /// Like [`Device::new`], with a [`Notifier`] receiving status and
    /// progress reports during chunked operations.
    pub fn with_notifier(port: P, notifier: Box<dyn Notifier>) -> Self {
        Device {
            port,
            notifier,
            device_id: None,
            revision: None,
            flash_size: None,
            ram_size: None,
            flash_base: constants::FLASH_BASE,
            link_initialized: false,
        }
    }

    /// Device ID, if [`Device::read_device_id`] has run.
    pub fn device_id(&self) -> Option<u32> {
        self.device_id
    }

    /// Detected device revision, if [`Device::read_device_id`] has run.
    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    /// Flash size in bytes, if [`Device::read_flash_size`] has run.
    pub fn flash_size(&self) -> Option<u32> {
        self.flash_size
    }

    /// RAM size in bytes, if [`Device::read_ram_size`] has run.
    pub fn ram_size(&self) -> Option<u32> {
        self.ram_size
    }

    /// Configured flash base address.
    pub fn flash_base(&self) -> u32 {
        self.flash_base
    }

    pub fn set_flash_base(&mut self, flash_base: u32) {
        self.flash_base = flash_base;
    }

    /// Whether the bootloader link is currently established. Cleared by
    /// [`Device::reset`] and by flash writes that disable the bootloader.
    pub fn is_link_initialized(&self) -> bool {
        self.link_initialized
    }

    fn ensure_link(&self) -> Result<()> {
        if self.link_initialized {
            Ok(())
        } else {
            Err(Error::Port(io::Error::new(
                io::ErrorKind::NotConnected,
                "bootloader link not initialized",
            )))
        }
    }

    fn opcode(&self, cmd: Command) -> u8 {
        // Before the device ID has been read the newer command set is
        // assumed; GET_CHIP_ID itself is identical in both sets.
        self.revision.unwrap_or(Revision::Rev2).opcode(cmd)
    }

    fn write_cmd(&mut self, cmd: Command, data: &[u8]) -> Result<()> {
        // [len | checksum | opcode]
        const HDR_LEN: usize = 3;

        let opcode = self.opcode(cmd);
        let pkt_len = HDR_LEN + data.len();
        if pkt_len > usize::from(std::u8::MAX) {
            // Logic error, just panic.
            panic!("packet too big");
        }

        let mut pkt = Vec::with_capacity(pkt_len);
        pkt.push(pkt_len as u8);
        pkt.push(command_checksum(opcode, data));
        pkt.push(opcode);
        pkt.extend_from_slice(data);

        log::trace!("sending {:?} ({:#04X}), pkt = {:?}", cmd, opcode, pkt);

        self.port.write_all(pkt.as_slice())?;
        self.port.flush()?;

        Ok(())
    }

    /// Wait for a single ACK/NAK marker, retrying up to `max_retries`
    /// additional reads (0 means a single attempt). Zero bytes and line
    /// noise preceding the marker are skipped within an attempt.
    fn read_ack(&mut self, max_retries: u32) -> Result<bool> {
        log::trace!("waiting for ACK");

        let mut attempts = 0u32;
        loop {
            let mut buf = [0u8; 2];
            let n = match self.port.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
                Err(e) => return Err(Error::Port(e)),
            };

            for byte in &buf[..n] {
                match *byte {
                    constants::ACK => {
                        log::trace!("ACK received");
                        return Ok(true);
                    }
                    constants::NACK => {
                        log::trace!("NAK received");
                        return Ok(false);
                    }
                    _ => (),
                }
            }

            if attempts >= max_retries {
                log::trace!("ACK bytes not found, giving up");
                return Err(Error::Timeout);
            }
            attempts += 1;
        }
    }

    fn write_ack(&mut self, ack: bool) -> Result<()> {
        let data: [u8; 2] =
            [0x00, if ack { constants::ACK } else { constants::NACK }];

        self.port.write_all(&data)?;
        self.port.flush()?;

        Ok(())
    }

    fn read_exact_with_retries(
        &mut self,
        buf: &mut [u8],
        max_retries: u32,
    ) -> Result<()> {
        let mut filled = 0;
        let mut attempts = 0u32;

        while filled < buf.len() {
            let n = match self.port.read(&mut buf[filled..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
                Err(e) => return Err(Error::Port(e)),
            };

            filled += n;
            if n == 0 {
                if attempts >= max_retries {
                    return Err(Error::Timeout);
                }
                attempts += 1;
            }
        }

        Ok(())
    }

    /// Read one length-prefixed response data packet into `buf`, verifying
    /// its checksum. Returns the actual data byte count, which may be less
    /// than `buf.len()`. The caller decides whether to ACK or NAK.
    fn read_response(
        &mut self,
        buf: &mut [u8],
        max_retries: u32,
    ) -> Result<usize> {
        const HDR_LEN: usize = 2;

        log::trace!("waiting for response header");
        let mut hdr = [0u8; HDR_LEN];
        self.read_exact_with_retries(&mut hdr, max_retries)?;
        log::trace!(
            "response header received, len = {}, cksum = {:#04X}",
            hdr[0],
            hdr[1]
        );

        let pkt_len = hdr[0] as usize;
        if pkt_len < HDR_LEN {
            return Err(Error::protocol(format!(
                "response length byte is {}, minimum is {}",
                pkt_len, HDR_LEN
            )));
        }

        let data_len = pkt_len - HDR_LEN;
        if data_len > buf.len() {
            return Err(Error::protocol(format!(
                "response too big, expected at most {} bytes, found {}",
                buf.len(),
                data_len
            )));
        }

        self.read_exact_with_retries(&mut buf[..data_len], max_retries)?;

        let checksum = response_checksum(&buf[..data_len]);
        if checksum != hdr[1] {
            return Err(Error::protocol(format!(
                "response checksum mismatch, expected {:#04X}, found {:#04X}",
                hdr[1], checksum
            )));
        }

        Ok(data_len)
    }

    /// Synchronize the link with the bootloader.
    ///
    /// Sends the fixed two-byte `0x55 0x55` pattern and expects the
    /// two-byte acknowledgement back. Both the positive and the negative
    /// acknowledgement confirm that the baudrate was detected; anything
    /// else is a protocol error. Must run before any other command.
    pub fn detect_auto_baud(&mut self) -> Result<()> {
        self.port.write_all(&[0x55, 0x55])?;
        self.port.flush()?;

        let mut reply = [0u8; 2];
        self.read_exact_with_retries(&mut reply, 1)?;

        match reply {
            [0x00, constants::ACK] => {
                log::debug!("auto baud acknowledged");
            }
            [0x00, constants::NACK] => {
                log::warn!("auto baud answered with NAK, link is in sync");
            }
            _ => {
                return Err(Error::protocol(format!(
                    "auto baud reply {:#04X} {:#04X}, \
                     expected 0x00 0xCC or 0x00 0x33",
                    reply[0], reply[1]
                )));
            }
        }

        self.link_initialized = true;
        Ok(())
    }

    /// Ping the bootloader. Succeeds iff the command is ACKed.
    pub fn ping(&mut self) -> Result<bool> {
        self.ensure_link()?;

        self.write_cmd(Command::Ping, &[])?;
        self.read_ack(0)
    }

    /// Get the status of the last issued command.
    ///
    /// An ACK only confirms that a packet was accepted; whether the
    /// requested action succeeded on the device is reported here.
    pub fn read_status(&mut self) -> Result<u8> {
        self.ensure_link()?;

        self.write_cmd(Command::GetStatus, &[])?;
        if !self.read_ack(0)? {
            return Err(Error::protocol("get-status command NAKed"));
        }

        let mut response = [0u8; 1];
        let n = match self.read_response(&mut response, 0) {
            Ok(n) => n,
            Err(e) => {
                let _ = self.write_ack(false);
                return Err(e);
            }
        };
        if n != 1 {
            self.write_ack(false)?;
            return Err(Error::protocol(format!(
                "expected 1 status byte, received {}",
                n
            )));
        }
        self.write_ack(true)?;

        Ok(response[0])
    }

    /// Read the device ID and derive the device revision from its top
    /// nibble. The revision selects the wire opcodes of a handful of
    /// commands on early samples.
    pub fn read_device_id(&mut self) -> Result<u32> {
        const CHIP_ID_RESPONSE_LEN: usize = 4;

        self.ensure_link()?;

        self.write_cmd(Command::GetChipId, &[])?;
        if !self.read_ack(0)? {
            return Err(Error::protocol("get-chip-id command NAKed"));
        }

        let mut response = [0u8; CHIP_ID_RESPONSE_LEN];
        let n = match self.read_response(&mut response, 0) {
            Ok(n) => n,
            Err(e) => {
                let _ = self.write_ack(false);
                return Err(e);
            }
        };
        if n != CHIP_ID_RESPONSE_LEN {
            self.write_ack(false)?;
            return Err(Error::protocol(format!(
                "expected {} device ID bytes, received {}",
                CHIP_ID_RESPONSE_LEN, n
            )));
        }
        self.write_ack(true)?;

        let device_id = bytes_to_u32(response);
        self.device_id = Some(device_id);
        self.revision = Some(Revision::from_device_id(device_id));

        log::debug!(
            "device ID {:#010X}, revision {:?}",
            device_id,
            self.revision.unwrap()
        );

        Ok(device_id)
    }

    /// Read the device flash size in bytes and store it in the session.
    ///
    /// The flash configuration register holds the number of flash sectors
    /// in its low byte.
    pub fn read_flash_size(&mut self) -> Result<u32> {
        let mut reg = [0u32; 1];
        self.read_memory_32(constants::FLASH_SIZE_CFG, &mut reg)?;

        let sectors = reg[0] & 0xFF;
        let flash_size = sectors * PAGE_ERASE_SIZE;
        self.flash_size = Some(flash_size);

        Ok(flash_size)
    }

    /// Read the device RAM size in bytes and store it in the session.
    ///
    /// The size is a 2-bit code decoded through a revision-dependent
    /// table, see [`Revision::ram_size_from_code`].
    pub fn read_ram_size(&mut self) -> Result<u32> {
        let mut reg = [0u32; 1];
        self.read_memory_32(constants::RAM_SIZE_CFG, &mut reg)?;

        let code = reg[0] & 0x03;
        let ram_size = self
            .revision
            .unwrap_or(Revision::Rev2)
            .ram_size_from_code(code);
        self.ram_size = Some(ram_size);

        Ok(ram_size)
    }

    /// Read `data.len()` words of device memory using 32-bit accesses,
    /// split into chunks of at most 63 words.
    ///
    /// `start_address` must be 4-byte aligned.
    pub fn read_memory_32(
        &mut self,
        start_address: u32,
        data: &mut [u32],
    ) -> Result<()> {
        if start_address & 0x03 != 0 {
            return Err(Error::argument(format!(
                "start address {:#010X} must be a multiple of 4",
                start_address
            )));
        }

        self.ensure_link()?;
        self.notifier.progress(0);

        let unit_count = data.len() as u32;
        let total_chunks = chunk_count(unit_count, MAX_MEMREAD_WORDS as u32);
        let mut staging = [0u8; MAX_MEMREAD_WORDS * 4];

        for (i, chunk) in
            chunks(unit_count, MAX_MEMREAD_WORDS as u32).enumerate()
        {
            let chunk_start = start_address + chunk.offset * 4;

            // 4B address (MSB first), 1B access width, 1B word count.
            let mut payload = [0u8; 6];
            payload[..4].copy_from_slice(&u32_to_bytes(chunk_start));
            payload[4] = ACCESS_WIDTH_32B;
            payload[5] = chunk.size as u8;

            self.notifier.progress((i as u32 * 100) / total_chunks);

            self.write_cmd(Command::MemoryRead, &payload)?;
            if !self.read_ack(0)? {
                return Err(Error::protocol(format!(
                    "memory read NAKed at address {:#010X}",
                    chunk_start
                )));
            }

            let expected = chunk.size as usize * 4;
            let n = match self.read_response(&mut staging[..expected], 0) {
                Ok(n) => n,
                Err(e) => {
                    let _ = self.write_ack(false);
                    return Err(e);
                }
            };
            if n != expected {
                self.write_ack(false)?;
                return Err(Error::protocol(format!(
                    "received {} bytes, expected {}",
                    n, expected
                )));
            }

            for j in 0..chunk.size as usize {
                let mut word = [0u8; 4];
                word.copy_from_slice(&staging[j * 4..j * 4 + 4]);
                data[chunk.offset as usize + j] = bytes_to_u32(word);
            }

            self.write_ack(true)?;
        }

        self.notifier.progress(100);

        Ok(())
    }

    /// Read `data.len()` bytes of device memory using 8-bit accesses,
    /// split into chunks of at most 253 bytes.
    pub fn read_memory_8(
        &mut self,
        start_address: u32,
        data: &mut [u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Err(Error::argument("read count is zero, must be at least 1"));
        }

        self.ensure_link()?;
        self.notifier.progress(0);

        let unit_count = data.len() as u32;
        let total_chunks = chunk_count(unit_count, MAX_MEMREAD_BYTES as u32);

        for (i, chunk) in
            chunks(unit_count, MAX_MEMREAD_BYTES as u32).enumerate()
        {
            let chunk_start = start_address + chunk.offset;

            let mut payload = [0u8; 6];
            payload[..4].copy_from_slice(&u32_to_bytes(chunk_start));
            payload[4] = ACCESS_WIDTH_8B;
            payload[5] = chunk.size as u8;

            self.notifier.progress((i as u32 * 100) / total_chunks);

            self.write_cmd(Command::MemoryRead, &payload)?;
            if !self.read_ack(0)? {
                return Err(Error::protocol(format!(
                    "memory read NAKed at address {:#010X}",
                    chunk_start
                )));
            }

            let expected = chunk.size as usize;
            let offset = chunk.offset as usize;
            let n = match self
                .read_response(&mut data[offset..offset + expected], 0)
            {
                Ok(n) => n,
                Err(e) => {
                    let _ = self.write_ack(false);
                    return Err(e);
                }
            };
            if n != expected {
                self.write_ack(false)?;
                return Err(Error::protocol(format!(
                    "received {} bytes, expected {}",
                    n, expected
                )));
            }

            self.write_ack(true)?;
        }

        self.notifier.progress(100);

        Ok(())
    }

    /// Write `data.len()` words to device SRAM using 32-bit accesses,
    /// split into chunks of at most 61 words.
    ///
    /// `start_address` must be 4-byte aligned and the range must not touch
    /// the bootloader's own work memory or stack.
    pub fn write_memory_32(
        &mut self,
        start_address: u32,
        data: &[u32],
    ) -> Result<()> {
        if start_address & 0x03 != 0 {
            return Err(Error::argument(format!(
                "start address {:#010X} must be a multiple of 4",
                start_address
            )));
        }
        self.check_not_bootloader_memory(
            start_address,
            data.len() as u32 * 4,
        )?;

        self.ensure_link()?;

        let unit_count = data.len() as u32;
        let total_chunks = chunk_count(unit_count, MAX_MEMWRITE_WORDS as u32);

        for (i, chunk) in
            chunks(unit_count, MAX_MEMWRITE_WORDS as u32).enumerate()
        {
            let chunk_start = start_address + chunk.offset * 4;

            // 4B address (MSB first), 1B access width, then the words.
            let mut payload =
                Vec::with_capacity(5 + chunk.size as usize * 4);
            payload.extend_from_slice(&u32_to_bytes(chunk_start));
            payload.push(ACCESS_WIDTH_32B);
            for j in 0..chunk.size as usize {
                payload.extend_from_slice(&u32_to_bytes(
                    data[chunk.offset as usize + j],
                ));
            }

            self.notifier.progress((i as u32 * 100) / total_chunks);

            self.write_cmd(Command::MemoryWrite, &payload)?;
            if !self.read_ack(MEMWRITE_ACK_RETRIES)? {
                return Err(Error::protocol(format!(
                    "memory write NAKed at address {:#010X}",
                    chunk_start
                )));
            }
        }

        self.notifier.progress(100);

        Ok(())
    }

    /// Write `data.len()` bytes to device SRAM using 8-bit accesses,
    /// split into chunks of at most 247 bytes.
    ///
    /// The range must not touch the bootloader's work memory or stack.
    pub fn write_memory_8(
        &mut self,
        start_address: u32,
        data: &[u8],
    ) -> Result<()> {
        self.check_not_bootloader_memory(start_address, data.len() as u32)?;

        self.ensure_link()?;

        let unit_count = data.len() as u32;
        let total_chunks = chunk_count(unit_count, MAX_MEMWRITE_BYTES as u32);

        for (i, chunk) in
            chunks(unit_count, MAX_MEMWRITE_BYTES as u32).enumerate()
        {
            let chunk_start = start_address + chunk.offset;
            let offset = chunk.offset as usize;

            let mut payload = Vec::with_capacity(5 + chunk.size as usize);
            payload.extend_from_slice(&u32_to_bytes(chunk_start));
            payload.push(ACCESS_WIDTH_8B);
            payload
                .extend_from_slice(&data[offset..offset + chunk.size as usize]);

            self.notifier.progress((i as u32 * 100) / total_chunks);

            self.write_cmd(Command::MemoryWrite, &payload)?;
            if !self.read_ack(MEMWRITE_ACK_RETRIES)? {
                return Err(Error::protocol(format!(
                    "memory write NAKed at address {:#010X}",
                    chunk_start
                )));
            }
        }

        self.notifier.progress(100);

        Ok(())
    }

    fn check_not_bootloader_memory(
        &self,
        start_address: u32,
        byte_count: u32,
    ) -> Result<()> {
        if memmap::in_bootloader_protected(start_address, byte_count) {
            return Err(Error::argument(format!(
                "range {:#010X} + {} bytes overlaps the bootloader work \
                 memory ({:#010X}-{:#010X}) or stack ({:#010X}-{:#010X})",
                start_address,
                byte_count,
                constants::BL_WORK_MEMORY_START,
                constants::BL_WORK_MEMORY_END,
                constants::BL_STACK_MEMORY_START,
                constants::BL_STACK_MEMORY_END,
            )));
        }

        Ok(())
    }

    /// Erase every flash page overlapping `start_address + byte_count`.
    ///
    /// Each page erase is ACKed by the device and then double-checked via
    /// [`Device::read_status`]: a locked page ACKs the command but fails
    /// the erase.
    pub fn erase_flash_range(
        &mut self,
        start_address: u32,
        byte_count: u32,
    ) -> Result<()> {
        self.ensure_link()?;
        self.notifier.progress(0);

        let page_count = chunk_count(byte_count, PAGE_ERASE_SIZE);
        for i in 0..page_count {
            let page_address = start_address + i * PAGE_ERASE_SIZE;
            log::debug!("erasing page #{}, address {:#010X}", i, page_address);

            self.write_cmd(
                Command::SectorErase,
                &u32_to_bytes(page_address),
            )?;
            if !self.read_ack(0)? {
                return Err(Error::protocol(format!(
                    "sector erase NAKed at address {:#010X}",
                    page_address
                )));
            }

            let status = self.read_status()?;
            if status != COMMAND_RET_SUCCESS {
                return Err(Error::protocol(format!(
                    "flash erase failed: {} ({:#04X}), pages may be locked",
                    status_code_to_str(status),
                    status
                )));
            }

            self.notifier.progress((100 * (i + 1)) / page_count);
        }

        Ok(())
    }

    /// Erase all customer-accessible flash sectors not protected by FCFG1.
    pub fn erase_flash_bank(&mut self) -> Result<()> {
        self.ensure_link()?;

        self.write_cmd(Command::BankErase, &[])?;
        if !self.read_ack(0)? {
            return Err(Error::protocol("bank erase NAKed"));
        }

        Ok(())
    }

    /// Program `data` into flash starting at `start_address`.
    ///
    /// The flash must already be erased, see [`Device::erase_flash_range`].
    /// Requires the flash size to be known ([`Device::read_flash_size`]).
    ///
    /// If the image carries a bootloader-lock configuration byte that
    /// disables the bootloader, the write is split in two segments and the
    /// one containing the lock byte is sent without waiting for a
    /// response; the link is marked uninitialized afterwards.
    pub fn write_flash_range(
        &mut self,
        start_address: u32,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_link()?;

        let byte_count = data.len() as u32;
        let flash_size = self.flash_size.ok_or_else(|| {
            Error::argument("flash size unknown, call read_flash_size first")
        })?;

        // The bootloader configuration byte sits at a fixed offset within
        // the last flash page.
        let bl_cfg_addr = self.flash_base + flash_size - PAGE_ERASE_SIZE
            + BL_CONFIG_PAGE_OFFSET;
        let bl_cfg_idx = bl_cfg_addr.wrapping_sub(start_address);

        let disables_bootloader = (bl_cfg_idx as usize) < data.len()
            && data[bl_cfg_idx as usize] != BL_CONFIG_ENABLED_BM;

        let transfers: Vec<Transfer> = if disables_bootloader {
            log::warn!("the written image disables the bootloader");
            self.notifier.status(
                "Warning: this image disables the bootloader; \
                 the device will stop answering once it is written",
                false,
            );

            let first_count = (bl_cfg_addr - start_address) & !0x03;
            vec![
                Transfer {
                    start_address,
                    byte_count: first_count,
                    start_offset: 0,
                    expect_ack: true,
                },
                // The segment writing the lock byte. The device may drop
                // the link right after it, so no response is awaited.
                Transfer {
                    start_address: bl_cfg_addr - (bl_cfg_addr % 4),
                    byte_count: byte_count - first_count,
                    start_offset: bl_cfg_idx - (bl_cfg_idx % 4),
                    expect_ack: false,
                },
            ]
        } else {
            vec![Transfer {
                start_address,
                byte_count,
                start_offset: 0,
                expect_ack: true,
            }]
        };

        let total_chunks =
            chunk_count(byte_count, MAX_BYTES_PER_TRANSFER as u32).max(1);
        let mut current_chunk = 0u32;

        for transfer in &transfers {
            if transfer.byte_count == 0 {
                continue;
            }

            self.cmd_download(transfer.start_address, transfer.byte_count)?;

            let status = self.read_status()?;
            if status != COMMAND_RET_SUCCESS {
                return Err(Error::protocol(format!(
                    "download rejected: {} ({:#04X})",
                    status_code_to_str(status),
                    status
                )));
            }

            let mut bytes_left = transfer.byte_count;
            let mut data_idx = transfer.start_offset;
            let mut is_retry = false;

            while bytes_left > 0 {
                let bytes_in_transfer =
                    (MAX_BYTES_PER_TRANSFER as u32).min(bytes_left);
                let chunk = &data[data_idx as usize
                    ..(data_idx + bytes_in_transfer) as usize];
                let chunk_addr = transfer.start_address
                    + (data_idx - transfer.start_offset);

                if !is_retry {
                    current_chunk += 1;
                }
                self.notifier
                    .progress((100 * current_chunk) / total_chunks);

                log::trace!(
                    "writing chunk #{} ({} B) at address {:#010X}",
                    current_chunk,
                    chunk.len(),
                    chunk_addr
                );

                self.write_cmd(Command::SendData, chunk)?;

                if transfer.expect_ack {
                    if !self.read_ack(SEND_DATA_ACK_RETRIES)? {
                        return Err(Error::protocol(format!(
                            "send-data NAKed at address {:#010X} (page {})",
                            chunk_addr,
                            memmap::address_to_page(chunk_addr)
                        )));
                    }

                    let status = self.read_status()?;
                    if status != COMMAND_RET_SUCCESS {
                        if is_retry {
                            // Same chunk failed twice, abort the write.
                            return Err(Error::protocol(format!(
                                "send-data failed twice at address \
                                 {:#010X} (page {}): {} ({:#04X})",
                                chunk_addr,
                                memmap::address_to_page(chunk_addr),
                                status_code_to_str(status),
                                status
                            )));
                        }

                        log::warn!(
                            "device returned {} for chunk at {:#010X}, \
                             retrying once",
                            status_code_to_str(status),
                            chunk_addr
                        );
                        is_retry = true;
                        continue;
                    }
                } else {
                    // The bootloader is being locked out, further
                    // responses may never come.
                    self.link_initialized = false;
                }

                bytes_left -= bytes_in_transfer;
                data_idx += bytes_in_transfer;
                is_retry = false;
            }
        }

        Ok(())
    }

    /// Prepare a flash download of `size` bytes at `address` and wait for
    /// the packet ACK. The caller must check [`Device::read_status`]
    /// afterwards.
    fn cmd_download(&mut self, address: u32, size: u32) -> Result<()> {
        let flash_size = self.flash_size.unwrap_or(0);
        if !memmap::in_flash(address, size, flash_size) {
            return Err(Error::argument(format!(
                "range {:#010X} + {} bytes is not in device flash",
                address, size
            )));
        }
        if size & 0x03 != 0 {
            return Err(Error::argument(
                "download byte count must be a multiple of 4",
            ));
        }

        // 4B program address, 4B program size.
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&u32_to_bytes(address));
        payload[4..].copy_from_slice(&u32_to_bytes(size));

        self.write_cmd(Command::Download, &payload)?;
        if !self.read_ack(0)? {
            return Err(Error::protocol("download command NAKed"));
        }

        Ok(())
    }

    /// Ask the device to compute the CRC-32 of `byte_count` bytes starting
    /// at `start_address`. The range must lie in flash or RAM.
    ///
    /// The result matches [`util::crc32_like_device`] for identical
    /// content, so a flash write can be verified without reading it back.
    pub fn calculate_crc32(
        &mut self,
        start_address: u32,
        byte_count: u32,
    ) -> Result<u32> {
        let flash_size = self.flash_size.unwrap_or(0);
        let ram_size = self.ram_size.unwrap_or(0);
        if !memmap::in_flash(start_address, byte_count, flash_size)
            && !memmap::in_ram(start_address, byte_count, ram_size)
        {
            return Err(Error::argument(format!(
                "range {:#010X} + {} bytes is not in device flash nor RAM",
                start_address, byte_count
            )));
        }

        self.ensure_link()?;
        self.notifier.progress(0);

        // 4B address, 4B byte count, 4B read-repeat count (always zero).
        let mut payload = [0u8; 12];
        payload[..4].copy_from_slice(&u32_to_bytes(start_address));
        payload[4..8].copy_from_slice(&u32_to_bytes(byte_count));

        self.write_cmd(Command::Crc32, &payload)?;

        // The device checksums the whole range before answering, give it
        // a few extra response attempts.
        if !self.read_ack(CRC32_ACK_RETRIES)? {
            return Err(Error::protocol("CRC32 command NAKed"));
        }

        let mut response = [0u8; 4];
        let n = match self.read_response(&mut response, 0) {
            Ok(n) => n,
            Err(e) => {
                let _ = self.write_ack(false);
                return Err(e);
            }
        };
        if n != 4 {
            self.write_ack(false)?;
            return Err(Error::protocol(format!(
                "expected 4 CRC bytes, received {}",
                n
            )));
        }
        self.write_ack(true)?;

        self.notifier.progress(100);

        Ok(bytes_to_u32(response))
    }

    /// Write one CCFG field: 4-byte field ID plus 4-byte field value.
    pub fn set_ccfg(&mut self, field_id: u32, field_value: u32) -> Result<()> {
        self.ensure_link()?;

        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&u32_to_bytes(field_id));
        payload[4..].copy_from_slice(&u32_to_bytes(field_value));

        self.write_cmd(Command::SetCcfg, &payload)?;
        if !self.read_ack(0)? {
            return Err(Error::protocol("set-CCFG command NAKed"));
        }

        Ok(())
    }

    /// Reset the device. The bootloader link must be re-established before
    /// any further command.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_link()?;

        self.write_cmd(Command::Reset, &[])?;
        if !self.read_ack(0)? {
            return Err(Error::protocol("reset command NAKed"));
        }

        self.link_initialized = false;
        Ok(())
    }
}

impl<P> fmt::Debug for Device<P>
where
    P: SerialPort,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Device")
            .field("device_id", &self.device_id)
            .field("revision", &self.revision)
            .field("flash_size", &self.flash_size)
            .field("ram_size", &self.ram_size)
            .field("flash_base", &self.flash_base)
            .field("link_initialized", &self.link_initialized)
            .field("port", &())
            .finish()
    }
}

/// Protocol name of a device status code.
pub fn status_code_to_str(status: u8) -> &'static str {
    match status {
        constants::COMMAND_RET_SUCCESS => "COMMAND_RET_SUCCESS",
        constants::COMMAND_RET_UNKNOWN_CMD => "COMMAND_RET_UNKNOWN_CMD",
        constants::COMMAND_RET_INVALID_CMD => "COMMAND_RET_INVALID_CMD",
        constants::COMMAND_RET_INVALID_ADR => "COMMAND_RET_INVALID_ADR",
        constants::COMMAND_RET_FLASH_FAIL => "COMMAND_RET_FLASH_FAIL",
        _ => "Unknown",
    }
}

/// Default serial port settings.
///
/// It's recommended to change only the baudrate since all other options
/// are the same for every device supporting this bootloader.
pub fn port_settings() -> serial::PortSettings {
    serial::PortSettings {
        baud_rate: serial::BaudRate::Baud115200,
        char_size: serial::CharSize::Bits8,
        parity: serial::Parity::ParityNone,
        stop_bits: serial::StopBits::Stop1,
        flow_control: serial::FlowControl::FlowNone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{collections::VecDeque, time::Duration};

    struct MockPort {
        input: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl MockPort {
        fn new() -> MockPort {
            MockPort {
                input: VecDeque::new(),
                written: Vec::new(),
            }
        }

        fn queue(&mut self, bytes: &[u8]) {
            self.input.extend(bytes.iter().copied());
        }
    }

    impl io::Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "mock read timeout",
                ));
            }

            let mut n = 0;
            while n < buf.len() {
                match self.input.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }

            Ok(n)
        }
    }

    impl io::Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[allow(bare_trait_objects)]
    impl SerialPort for MockPort {
        fn timeout(&self) -> Duration {
            Duration::from_millis(0)
        }
        fn set_timeout(&mut self, _timeout: Duration) -> serial::Result<()> {
            Ok(())
        }
        fn configure(
            &mut self,
            _settings: &serial::PortSettings,
        ) -> serial::Result<()> {
            Ok(())
        }
        fn reconfigure(
            &mut self,
            _setup: &Fn(&mut serial::SerialPortSettings) -> serial::Result<()>,
        ) -> serial::Result<()> {
            Ok(())
        }
        fn set_rts(&mut self, _level: bool) -> serial::Result<()> {
            Ok(())
        }
        fn set_dtr(&mut self, _level: bool) -> serial::Result<()> {
            Ok(())
        }
        fn read_cts(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
        fn read_dsr(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
        fn read_ri(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
        fn read_cd(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
    }

    fn linked_device() -> Device<MockPort> {
        let mut device = Device::new(MockPort::new());
        device.link_initialized = true;
        device
    }

    /// Bytes the device sends for a packet ACK.
    fn ack() -> Vec<u8> {
        vec![0x00, constants::ACK]
    }

    fn nak() -> Vec<u8> {
        vec![0x00, constants::NACK]
    }

    /// A response data packet as sent by the device.
    fn response(data: &[u8]) -> Vec<u8> {
        let mut pkt = vec![(data.len() + 2) as u8, response_checksum(data)];
        pkt.extend_from_slice(data);
        pkt
    }

    /// The full device side of a get-status exchange.
    fn status_exchange(status: u8) -> Vec<u8> {
        let mut bytes = ack();
        bytes.extend(response(&[status]));
        bytes
    }

    /// What the host writes for one command packet.
    fn cmd_packet(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![
            (3 + payload.len()) as u8,
            command_checksum(opcode, payload),
            opcode,
        ];
        pkt.extend_from_slice(payload);
        pkt
    }

    #[derive(Debug, PartialEq)]
    enum HostPkt {
        Ack(bool),
        Cmd { opcode: u8, payload: Vec<u8> },
    }

    /// Split the host output stream back into command packets and
    /// host-side ACK/NAK pairs. Command packets never start with 0x00
    /// (their length byte is at least 3).
    fn parse_host_stream(mut bytes: &[u8]) -> Vec<HostPkt> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            if bytes[0] == 0x00 {
                out.push(HostPkt::Ack(bytes[1] == constants::ACK));
                bytes = &bytes[2..];
            } else {
                let len = bytes[0] as usize;
                out.push(HostPkt::Cmd {
                    opcode: bytes[2],
                    payload: bytes[3..len].to_vec(),
                });
                bytes = &bytes[len..];
            }
        }
        out
    }

    fn host_cmds(bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        parse_host_stream(bytes)
            .into_iter()
            .filter_map(|pkt| match pkt {
                HostPkt::Cmd { opcode, payload } => Some((opcode, payload)),
                HostPkt::Ack(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_auto_baud_positive() {
        let mut device = Device::new(MockPort::new());
        device.port.queue(&[0x00, constants::ACK]);

        device.detect_auto_baud().unwrap();
        assert!(device.is_link_initialized());
        assert_eq!(device.port.written, vec![0x55, 0x55]);
    }

    #[test]
    fn test_auto_baud_negative_still_synchronizes() {
        let mut device = Device::new(MockPort::new());
        device.port.queue(&[0x00, constants::NACK]);

        device.detect_auto_baud().unwrap();
        assert!(device.is_link_initialized());
    }

    #[test]
    fn test_auto_baud_garbage_is_protocol_error() {
        let mut device = Device::new(MockPort::new());
        device.port.queue(&[0xDE, 0xAD]);

        match device.detect_auto_baud() {
            Err(Error::Protocol(_)) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(!device.is_link_initialized());
    }

    #[test]
    fn test_commands_require_initialized_link() {
        let mut device = Device::new(MockPort::new());

        match device.ping() {
            Err(Error::Port(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        // Nothing must reach the wire.
        assert!(device.port.written.is_empty());
    }

    #[test]
    fn test_ping() {
        let mut device = linked_device();
        device.port.queue(&ack());

        assert!(device.ping().unwrap());
        assert_eq!(device.port.written, cmd_packet(0x20, &[]));

        let mut device = linked_device();
        device.port.queue(&nak());
        assert!(!device.ping().unwrap());
    }

    #[test]
    fn test_ping_timeout() {
        let mut device = linked_device();

        match device.ping() {
            Err(Error::Timeout) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_read_status() {
        let mut device = linked_device();
        device.port.queue(&status_exchange(constants::COMMAND_RET_SUCCESS));

        assert_eq!(device.read_status().unwrap(), 0x40);

        let pkts = parse_host_stream(&device.port.written);
        assert_eq!(
            pkts,
            vec![
                HostPkt::Cmd { opcode: 0x23, payload: vec![] },
                HostPkt::Ack(true),
            ]
        );
    }

    #[test]
    fn test_read_device_id_detects_revision() {
        let mut device = linked_device();
        device.port.queue(&ack());
        device.port.queue(&response(&[0x1B, 0x99, 0xA0, 0x2F]));

        let id = device.read_device_id().unwrap();
        assert_eq!(id, 0x1B99_A02F);
        assert_eq!(device.device_id(), Some(0x1B99_A02F));
        assert_eq!(device.revision(), Some(Revision::Rev1));

        // Rev1 shifts the memory read opcode to 0x2C.
        assert_eq!(device.opcode(Command::MemoryRead), 0x2C);
    }

    #[test]
    fn test_read_device_id_short_response_is_naked() {
        let mut device = linked_device();
        device.port.queue(&ack());
        device.port.queue(&response(&[0x1B, 0x99]));

        match device.read_device_id() {
            Err(Error::Protocol(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        // The host must have NAKed the data packet.
        assert_eq!(
            parse_host_stream(&device.port.written).last().unwrap(),
            &HostPkt::Ack(false)
        );
    }

    #[test]
    fn test_read_memory_32() {
        let mut device = linked_device();
        device.port.queue(&ack());
        device.port.queue(&response(&[
            0x00, 0x00, 0x00, 0x10, // word 0
            0xDE, 0xAD, 0xBE, 0xEF, // word 1
        ]));

        let mut words = [0u32; 2];
        device.read_memory_32(0x1000, &mut words).unwrap();
        assert_eq!(words, [0x10, 0xDEAD_BEEF]);

        let cmds = host_cmds(&device.port.written);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].0, 0x2A);
        // 4B address, access width 1, 2 words.
        assert_eq!(cmds[0].1, vec![0x00, 0x00, 0x10, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_read_memory_32_misaligned() {
        let mut device = linked_device();

        match device.read_memory_32(0x1001, &mut [0u32; 1]) {
            Err(Error::Argument(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(device.port.written.is_empty());
    }

    #[test]
    fn test_read_memory_8_chunking() {
        // 300 bytes need two read commands: 253 + 47.
        let mut device = linked_device();

        let chunk0: Vec<u8> = (0..253u32).map(|i| i as u8).collect();
        let chunk1: Vec<u8> = (0..47u32).map(|i| (200 + i) as u8).collect();
        device.port.queue(&ack());
        device.port.queue(&response(&chunk0));
        device.port.queue(&ack());
        device.port.queue(&response(&chunk1));

        let mut data = [0u8; 300];
        device.read_memory_8(0x2000_2000, &mut data).unwrap();
        assert_eq!(&data[..253], chunk0.as_slice());
        assert_eq!(&data[253..], chunk1.as_slice());

        let cmds = host_cmds(&device.port.written);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].1[5], 253);
        assert_eq!(cmds[1].1[5], 47);
        // Second chunk starts 253 bytes higher.
        assert_eq!(
            &cmds[1].1[..4],
            &u32_to_bytes(0x2000_2000 + 253)[..]
        );
    }

    #[test]
    fn test_read_flash_size() {
        let mut device = linked_device();
        device.port.queue(&ack());
        // 32 sectors.
        device.port.queue(&response(&[0x00, 0x00, 0x00, 0x20]));

        let flash_size = device.read_flash_size().unwrap();
        assert_eq!(flash_size, 32 * 4096);
        assert_eq!(device.flash_size(), Some(32 * 4096));

        let cmds = host_cmds(&device.port.written);
        assert_eq!(&cmds[0].1[..4], &u32_to_bytes(0x4003_002C)[..]);
    }

    #[test]
    fn test_read_ram_size_uses_revision_table() {
        // Unknown revision defaults to the Rev2 table.
        let mut device = linked_device();
        device.port.queue(&ack());
        device.port.queue(&response(&[0x00, 0x00, 0x00, 0x03]));
        assert_eq!(device.read_ram_size().unwrap(), 0x5000);

        let mut device = linked_device();
        device.revision = Some(Revision::Rev1);
        device.port.queue(&ack());
        device.port.queue(&response(&[0x00, 0x00, 0x00, 0x03]));
        assert_eq!(device.read_ram_size().unwrap(), 0x4000);
        assert_eq!(device.ram_size(), Some(0x4000));
    }

    #[test]
    fn test_write_memory_8_chunking() {
        // 500 bytes need three write commands: 247 + 247 + 6.
        let mut device = linked_device();
        for _ in 0..3 {
            device.port.queue(&ack());
        }

        let data = [0xA5u8; 500];
        device.write_memory_8(0x2000_1000, &data).unwrap();

        let cmds = host_cmds(&device.port.written);
        assert_eq!(cmds.len(), 3);

        let sizes: Vec<usize> =
            cmds.iter().map(|(_, payload)| payload.len() - 5).collect();
        assert_eq!(sizes, vec![247, 247, 6]);

        assert_eq!(&cmds[0].1[..4], &u32_to_bytes(0x2000_1000)[..]);
        assert_eq!(&cmds[1].1[..4], &u32_to_bytes(0x2000_1000 + 247)[..]);
        assert_eq!(&cmds[2].1[..4], &u32_to_bytes(0x2000_1000 + 494)[..]);
        // 8-bit access width.
        assert!(cmds.iter().all(|(_, payload)| payload[4] == 0));
    }

    #[test]
    fn test_write_memory_rejects_bootloader_memory() {
        let mut device = linked_device();

        // Overlaps the bootloader work memory.
        match device.write_memory_32(0x2000_0100, &[0u32; 0x80]) {
            Err(Error::Argument(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        // Overlaps the bootloader stack from below.
        match device.write_memory_8(0x2000_0FF0, &[0u8; 0x20]) {
            Err(Error::Argument(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        // Nothing reached the wire.
        assert!(device.port.written.is_empty());
    }

    #[test]
    fn test_write_memory_32_marshals_words_big_endian() {
        let mut device = linked_device();
        device.port.queue(&ack());

        device
            .write_memory_32(0x2000_2000, &[0x1122_3344, 0x0000_00FF])
            .unwrap();

        let cmds = host_cmds(&device.port.written);
        assert_eq!(cmds[0].0, 0x2B);
        assert_eq!(
            cmds[0].1,
            vec![
                0x20, 0x00, 0x20, 0x00, // address
                0x01, // access width
                0x11, 0x22, 0x33, 0x44, 0x00, 0x00, 0x00, 0xFF,
            ]
        );
    }

    #[test]
    fn test_erase_flash_range_pages() {
        // 10000 bytes span three 4096-byte pages.
        let mut device = linked_device();
        for _ in 0..3 {
            device.port.queue(&ack());
            device
                .port
                .queue(&status_exchange(constants::COMMAND_RET_SUCCESS));
        }

        device.erase_flash_range(0, 10000).unwrap();

        let cmds = host_cmds(&device.port.written);
        let erases: Vec<&(u8, Vec<u8>)> =
            cmds.iter().filter(|(op, _)| *op == 0x26).collect();
        assert_eq!(erases.len(), 3);
        assert_eq!(erases[0].1, u32_to_bytes(0).to_vec());
        assert_eq!(erases[1].1, u32_to_bytes(4096).to_vec());
        assert_eq!(erases[2].1, u32_to_bytes(8192).to_vec());
    }

    #[test]
    fn test_erase_flash_range_checks_status() {
        // ACKed erase with a failing status must abort: a locked page
        // ACKs the command but does not erase.
        let mut device = linked_device();
        device.port.queue(&ack());
        device
            .port
            .queue(&status_exchange(constants::COMMAND_RET_FLASH_FAIL));

        match device.erase_flash_range(0, 4096) {
            Err(Error::Protocol(msg)) => {
                assert!(msg.contains("COMMAND_RET_FLASH_FAIL"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    fn queue_acked_chunks(device: &mut Device<MockPort>, chunks: u32) {
        for _ in 0..chunks {
            device.port.queue(&ack());
            device
                .port
                .queue(&status_exchange(constants::COMMAND_RET_SUCCESS));
        }
    }

    #[test]
    fn test_write_flash_range_plain() {
        let mut device = linked_device();
        device.flash_size = Some(0x1000);

        let mut data = vec![0xFFu8; 512];
        // Keep the bootloader enabled byte untouched; the image does not
        // even reach the configuration page.
        data[0] = 0x55;

        // download + 3 chunks (252 + 252 + 8).
        queue_acked_chunks(&mut device, 4);

        device.write_flash_range(0, &data).unwrap();

        let cmds = host_cmds(&device.port.written);
        let downloads: Vec<_> =
            cmds.iter().filter(|(op, _)| *op == 0x21).collect();
        let send_datas: Vec<_> =
            cmds.iter().filter(|(op, _)| *op == 0x24).collect();
        assert_eq!(downloads.len(), 1);
        assert_eq!(send_datas.len(), 3);
        assert_eq!(send_datas[0].1.len(), 252);
        assert_eq!(send_datas[2].1.len(), 8);
        assert!(device.is_link_initialized());
    }

    #[test]
    fn test_write_flash_range_splits_on_bootloader_lock() {
        let mut device = linked_device();
        device.flash_size = Some(0x1000);

        // Whole-flash image whose lock configuration byte (page offset
        // 0xFDB) is not the bootloader-enabled value.
        let mut data = vec![0xFFu8; 0x1000];
        data[0xFDB] = 0x00;

        // First segment: 0xFD8 bytes, download + 17 acked chunks.
        queue_acked_chunks(&mut device, 1 + 17);
        // Second segment: download acked, then nothing. The lock chunk
        // must be written without waiting for any response.
        queue_acked_chunks(&mut device, 1);

        device.write_flash_range(0, &data).unwrap();

        let cmds = host_cmds(&device.port.written);
        let downloads: Vec<_> =
            cmds.iter().filter(|(op, _)| *op == 0x21).collect();
        assert_eq!(downloads.len(), 2);
        // Segment boundaries: [0, 0xFD8) and [0xFD8, 0x1000).
        assert_eq!(downloads[0].1[..4], u32_to_bytes(0)[..]);
        assert_eq!(downloads[0].1[4..], u32_to_bytes(0xFD8)[..]);
        assert_eq!(downloads[1].1[..4], u32_to_bytes(0xFD8)[..]);
        assert_eq!(downloads[1].1[4..], u32_to_bytes(0x28)[..]);

        let send_datas: Vec<_> =
            cmds.iter().filter(|(op, _)| *op == 0x24).collect();
        assert_eq!(send_datas.len(), 17 + 1);
        assert_eq!(send_datas.last().unwrap().1.len(), 0x28);

        // The link is gone once the lock byte is written.
        assert!(!device.is_link_initialized());
        // And every queued response was consumed, i.e. the host never
        // tried to read an ACK for the final segment.
        assert!(device.port.input.is_empty());
    }

    #[test]
    fn test_write_flash_range_retries_failed_chunk_once() {
        let mut device = linked_device();
        device.flash_size = Some(0x1000);

        let data = vec![0x5Au8; 8];

        // download OK, first attempt ACKed but failing status, retry OK.
        queue_acked_chunks(&mut device, 1);
        device.port.queue(&ack());
        device
            .port
            .queue(&status_exchange(constants::COMMAND_RET_FLASH_FAIL));
        queue_acked_chunks(&mut device, 1);

        device.write_flash_range(0, &data).unwrap();

        let cmds = host_cmds(&device.port.written);
        let send_datas: Vec<_> =
            cmds.iter().filter(|(op, _)| *op == 0x24).collect();
        // Same chunk sent twice.
        assert_eq!(send_datas.len(), 2);
        assert_eq!(send_datas[0].1, send_datas[1].1);
    }

    #[test]
    fn test_write_flash_range_aborts_after_second_failure() {
        let mut device = linked_device();
        device.flash_size = Some(0x1000);

        let data = vec![0x5Au8; 8];

        queue_acked_chunks(&mut device, 1); // download
        for _ in 0..2 {
            device.port.queue(&ack());
            device
                .port
                .queue(&status_exchange(constants::COMMAND_RET_FLASH_FAIL));
        }

        match device.write_flash_range(0, &data) {
            Err(Error::Protocol(msg)) => assert!(msg.contains("twice")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_write_flash_range_requires_known_flash_size() {
        let mut device = linked_device();

        match device.write_flash_range(0, &[0u8; 4]) {
            Err(Error::Argument(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(device.port.written.is_empty());
    }

    #[test]
    fn test_calculate_crc32() {
        let mut device = linked_device();
        device.flash_size = Some(0x1000);
        device.port.queue(&ack());
        device.port.queue(&response(&[0xCB, 0xF4, 0x39, 0x26]));

        let crc = device.calculate_crc32(0, 0x100).unwrap();
        assert_eq!(crc, 0xCBF4_3926);

        let cmds = host_cmds(&device.port.written);
        assert_eq!(cmds[0].0, 0x27);
        // Address, byte count and a zeroed read-repeat trailer.
        assert_eq!(cmds[0].1.len(), 12);
        assert_eq!(&cmds[0].1[8..], &[0, 0, 0, 0]);
        assert_eq!(
            parse_host_stream(&device.port.written).last().unwrap(),
            &HostPkt::Ack(true)
        );
    }

    #[test]
    fn test_calculate_crc32_short_response() {
        let mut device = linked_device();
        device.flash_size = Some(0x1000);
        device.port.queue(&ack());
        device.port.queue(&response(&[0xCB, 0xF4]));

        match device.calculate_crc32(0, 0x100) {
            Err(Error::Protocol(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(
            parse_host_stream(&device.port.written).last().unwrap(),
            &HostPkt::Ack(false)
        );
    }

    #[test]
    fn test_calculate_crc32_range_validation() {
        let mut device = linked_device();
        device.flash_size = Some(0x1000);
        device.ram_size = Some(0x1000);

        match device.calculate_crc32(0x4000_0000, 4) {
            Err(Error::Argument(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(device.port.written.is_empty());
    }

    #[test]
    fn test_set_ccfg() {
        let mut device = linked_device();
        device.port.queue(&ack());

        device.set_ccfg(0x0000_0006, 0x0000_00C5).unwrap();

        let cmds = host_cmds(&device.port.written);
        assert_eq!(cmds[0].0, 0x2D);
        assert_eq!(
            cmds[0].1,
            vec![0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0xC5]
        );
    }

    #[test]
    fn test_reset_drops_the_link() {
        let mut device = linked_device();
        device.port.queue(&ack());

        device.reset().unwrap();
        assert!(!device.is_link_initialized());

        // A new command without re-synchronizing must fail.
        match device.ping() {
            Err(Error::Port(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_bank_erase() {
        let mut device = linked_device();
        device.port.queue(&ack());

        device.erase_flash_bank().unwrap();
        assert_eq!(device.port.written, cmd_packet(0x2C, &[]));
    }

    #[test]
    fn test_rev1_uses_shifted_opcodes() {
        let mut device = linked_device();
        device.revision = Some(Revision::Rev1);
        device.port.queue(&ack());

        device.erase_flash_bank().unwrap();
        assert_eq!(device.port.written, cmd_packet(0x2A, &[]));
    }

    #[test]
    fn test_response_checksum_is_verified() {
        let mut device = linked_device();
        device.port.queue(&ack());
        // Corrupted checksum byte.
        device.port.queue(&[0x06, 0x00, 0x1B, 0x99, 0xA0, 0x2F]);

        match device.read_device_id() {
            Err(Error::Protocol(msg)) => assert!(msg.contains("checksum")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
