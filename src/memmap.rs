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

//! # Memory map predicates
//!
//! Pure range checks against the device geometry, used as guards before
//! every memory-mutating command. The bootloader itself does not protect
//! its own SRAM work memory and stack; writing there crashes it until the
//! next power cycle, so those ranges are rejected host-side.

use crate::constants::{
    BL_STACK_MEMORY_END, BL_STACK_MEMORY_START, BL_WORK_MEMORY_END,
    FLASH_BASE, PAGE_ERASE_SIZE, RAM_BASE,
};

/// Whether `(start_address, byte_count)` lies fully within device flash.
pub fn in_flash(start_address: u32, byte_count: u32, flash_size: u32) -> bool {
    let end_addr = start_address + byte_count;

    start_address >= FLASH_BASE && end_addr <= FLASH_BASE + flash_size
}

/// Whether `(start_address, byte_count)` lies fully within device RAM.
pub fn in_ram(start_address: u32, byte_count: u32, ram_size: u32) -> bool {
    let end_addr = start_address + byte_count;

    start_address >= RAM_BASE && end_addr <= RAM_BASE + ram_size
}

/// Whether `(start_address, byte_count)` touches the bootloader's own work
/// memory or stack. These are fixed intervals, independent of device size.
pub fn in_bootloader_protected(start_address: u32, byte_count: u32) -> bool {
    let end_addr = start_address + byte_count;

    if start_address <= BL_WORK_MEMORY_END {
        return true;
    }

    if start_address >= BL_STACK_MEMORY_START
        && start_address <= BL_STACK_MEMORY_END
    {
        return true;
    }

    if end_addr >= BL_STACK_MEMORY_START && end_addr <= BL_STACK_MEMORY_END {
        return true;
    }

    false
}

/// Flash page containing `address`.
#[inline]
pub fn address_to_page(address: u32) -> u32 {
    (address - FLASH_BASE) / PAGE_ERASE_SIZE
}
