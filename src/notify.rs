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

/// Status and progress reporting, implemented by the caller and attached
/// to the [`Device`](crate::Device) at construction.
///
/// Long chunked transfers report their progress through this trait; the
/// library itself never prints anything.
pub trait Notifier {
    /// A human-readable status line, e.g. the bootloader-disable warning.
    fn status(&mut self, text: &str, is_error: bool) {
        let _ = (text, is_error);
    }

    /// Percentage (0–100) of the current chunked operation.
    fn progress(&mut self, percent: u32) {
        let _ = percent;
    }
}

/// A [`Notifier`] that discards every report.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {}
