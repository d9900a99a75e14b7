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

/// ACK byte
pub const ACK: u8                       = 0xCC;
/// NACK byte
pub const NACK: u8                      = 0x33;

/// Access width flag for 32-bit memory accesses.
pub const ACCESS_WIDTH_32B: u8          = 1;
/// Access width flag for 8-bit memory accesses.
pub const ACCESS_WIDTH_8B: u8           = 0;

/// Maximum bytes per `COMMAND_SEND_DATA` transfer.
pub const MAX_BYTES_PER_TRANSFER: usize = 252;
/// Maximum bytes per 8-bit `COMMAND_MEMORY_WRITE`.
pub const MAX_MEMWRITE_BYTES: usize     = 247;
/// Maximum words per 32-bit `COMMAND_MEMORY_WRITE`.
pub const MAX_MEMWRITE_WORDS: usize     = 61;
/// Maximum bytes per 8-bit `COMMAND_MEMORY_READ`.
pub const MAX_MEMREAD_BYTES: usize      = 253;
/// Maximum words per 32-bit `COMMAND_MEMORY_READ`.
pub const MAX_MEMREAD_WORDS: usize      = 63;

pub const COMMAND_RET_SUCCESS: u8       = 0x40;
pub const COMMAND_RET_UNKNOWN_CMD: u8   = 0x41;
pub const COMMAND_RET_INVALID_CMD: u8   = 0x42;
pub const COMMAND_RET_INVALID_ADR: u8   = 0x43;
pub const COMMAND_RET_FLASH_FAIL: u8    = 0x44;

/// Flash base address.
pub const FLASH_BASE: u32               = 0x00000000;
/// SRAM base address.
pub const RAM_BASE: u32                 = 0x20000000;
/// Flash erase page size, in bytes.
pub const PAGE_ERASE_SIZE: u32          = 4096;

/// FLASH.FLASH_SIZE register, number of flash sectors at bits [7:0].
pub const FLASH_SIZE_CFG: u32           = 0x4003002C;
/// Register holding the RAM size code at bits [1:0].
pub const RAM_SIZE_CFG: u32             = 0x40082250;

/// Offset of the bootloader-enable byte within the last flash page.
pub const BL_CONFIG_PAGE_OFFSET: u32    = 0xFDB;
/// Value of the bootloader-enable byte while the bootloader is enabled.
pub const BL_CONFIG_ENABLED_BM: u8      = 0xC5;

/// SRAM range used by the running bootloader as work memory.
pub const BL_WORK_MEMORY_START: u32     = 0x20000000;
pub const BL_WORK_MEMORY_END: u32       = 0x2000016F;
/// SRAM range used by the running bootloader as its stack.
pub const BL_STACK_MEMORY_START: u32    = 0x20000FC0;
pub const BL_STACK_MEMORY_END: u32      = 0x20000FFF;
