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

use std::io;

/// Result of a bootloader operation.
pub type Result<T> = std::result::Result<T, Error>;

/// Bootloader operation errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The serial transport is not open or usable.
    #[error("serial port error: {0}")]
    Port(#[from] io::Error),

    /// A caller argument error: misaligned address, oversized payload or
    /// a write into the bootloader's protected memory.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// No ACK/NAK received within the retry budget.
    #[error("timed out waiting for ACK/NAK")]
    Timeout,

    /// Checksum mismatch, wrong response byte count, device NAK or an
    /// unexpected device status.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reserved for commands this protocol variant does not implement.
    #[error("unsupported bootloader command")]
    Unsupported,
}

impl Error {
    pub(crate) fn argument(msg: impl Into<String>) -> Error {
        Error::Argument(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }
}
