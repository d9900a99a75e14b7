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

//! # Utilities
//!
//! Marshalling helpers for the wire format (all multi-byte integers are
//! big-endian on the wire), the single-byte packet checksum, the host-side
//! CRC-32 that mirrors the checksum computed by the device ROM, and the
//! chunking math shared by every size-limited transfer.

/// Encode a 32-bit value as big-endian bytes (MSB first on the wire).
#[inline]
pub fn u32_to_bytes(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Decode a big-endian 32-bit value from the wire.
#[inline]
pub fn bytes_to_u32(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// Reverse the byte order of a 4-byte buffer in place.
#[inline]
pub fn swap_bytes(buf: &mut [u8; 4]) {
    buf.swap(0, 3);
    buf.swap(1, 2);
}

/// Single-byte checksum of a command packet: sum of the opcode and all
/// payload bytes, modulo 256.
pub fn command_checksum(cmd: u8, data: &[u8]) -> u8 {
    data.iter()
        .fold(cmd, |checksum, byte| checksum.wrapping_add(*byte))
}

/// Checksum of a response data packet: sum of the data bytes, modulo 256.
#[inline]
pub fn response_checksum(data: &[u8]) -> u8 {
    command_checksum(0, data)
}

// Nibble lookup table for the reflected 0xEDB88320 polynomial, the same
// table the bootloader ROM uses for its CRC32 command.
#[rustfmt::skip]
const CRC32_LUT: [u32; 16] = [
    0x00000000, 0x1DB71064, 0x3B6E20C8, 0x26D930AC,
    0x76DC4190, 0x6B6B51F4, 0x4DB26158, 0x5005713C,
    0xEDB88320, 0xF00F9344, 0xD6D6A3E8, 0xCB61B38C,
    0x9B64C2B0, 0x86D3D2D4, 0xA00AE278, 0xBDBDF21C,
];

/// Compute the CRC-32 of `data` exactly like the device's CRC32 command
/// does, so flashed content can be verified by comparing checksums instead
/// of reading it back.
pub fn crc32_like_device(data: &[u8]) -> u32 {
    let mut acc: u32 = 0xFFFF_FFFF;

    for byte in data {
        let byte = u32::from(*byte);
        let index = (acc ^ byte) & 0x0F;
        acc = (acc >> 4) ^ CRC32_LUT[index as usize];
        let index = (acc ^ (byte >> 4)) & 0x0F;
        acc = (acc >> 4) ^ CRC32_LUT[index as usize];
    }

    acc ^ 0xFFFF_FFFF
}

/// One protocol-level chunk of a larger transfer. `offset` and `size` are
/// in transfer units (bytes for 8-bit accesses, words for 32-bit ones).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub offset: u32,
    pub size: u32,
}

/// Number of chunks needed to move `total` units in chunks of at most
/// `max` units.
#[inline]
pub fn chunk_count(total: u32, max: u32) -> u32 {
    if total % max != 0 {
        (total / max) + 1
    } else {
        total / max
    }
}

/// Iterate over the chunks of a `total`-unit transfer, `max` units at a
/// time. Every chunk but the last has exactly `max` units.
pub fn chunks(total: u32, max: u32) -> impl Iterator<Item = ChunkSpec> {
    debug_assert!(max != 0);

    (0..chunk_count(total, max)).map(move |i| {
        let offset = i * max;
        ChunkSpec {
            offset,
            size: max.min(total - offset),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_round_trip() {
        for &x in &[0u32, 1, 0xFF, 0x1234_5678, 0xDEAD_BEEF, u32::MAX] {
            assert_eq!(bytes_to_u32(u32_to_bytes(x)), x);
        }

        // MSB first on the wire.
        assert_eq!(u32_to_bytes(0x1234_5678), [0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_swap_bytes() {
        let mut buf = [0x12, 0x34, 0x56, 0x78];
        swap_bytes(&mut buf);
        assert_eq!(buf, [0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_command_checksum() {
        // nonsensical data, just to make sure it works.
        const DATA: &[u8] = &[0xde, 0xad, 0xbe, 0xef];
        assert_eq!(command_checksum(0xCA, DATA), 0x02);

        assert_eq!(command_checksum(0x20, &[]), 0x20);
        assert_eq!(response_checksum(&[0x40]), 0x40);
    }

    #[test]
    fn test_crc32_check_values() {
        assert_eq!(crc32_like_device(b""), 0x0000_0000);
        assert_eq!(crc32_like_device(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32_like_device(&[0x00]), 0xD202_EF8D);
    }

    #[test]
    fn test_crc32_is_order_sensitive() {
        assert_ne!(crc32_like_device(&[0x00]), crc32_like_device(&[0x01]));

        let data = b"cc26x0";
        let doubled: Vec<u8> =
            data.iter().chain(data.iter()).copied().collect();
        assert_ne!(
            crc32_like_device(&doubled),
            crc32_like_device(data).wrapping_mul(2)
        );
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(500, 247), 3);
        assert_eq!(chunk_count(494, 247), 2);
        assert_eq!(chunk_count(1, 247), 1);
        assert_eq!(chunk_count(10000, 4096), 3);
    }

    #[test]
    fn test_chunks_cover_the_transfer() {
        for &(total, max) in
            &[(500u32, 247u32), (494, 247), (252, 252), (10000, 4096), (6, 63)]
        {
            let specs: Vec<ChunkSpec> = chunks(total, max).collect();

            assert_eq!(specs.len() as u32, chunk_count(total, max));
            assert_eq!(specs.iter().map(|c| c.size).sum::<u32>(), total);
            assert!(specs.iter().all(|c| c.size <= max));

            let last = specs.last().unwrap();
            let expected_last = if total % max == 0 { max } else { total % max };
            assert_eq!(last.size, expected_last);

            // Chunks are contiguous and start at zero.
            let mut offset = 0;
            for chunk in &specs {
                assert_eq!(chunk.offset, offset);
                offset += chunk.size;
            }
        }
    }

    #[test]
    fn test_write_memory_8_chunk_sizes() {
        let sizes: Vec<u32> = chunks(500, 247).map(|c| c.size).collect();
        assert_eq!(sizes, vec![247, 247, 6]);
    }
}
