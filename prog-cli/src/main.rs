// Copyright 2021 Locha Mesh Developers <contact@locha.io>
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

use std::{fs, time::Duration};

use serial::SerialPort;

use anyhow::{bail, Context, Result};
use clap::{crate_authors, crate_version, App, AppSettings, Arg};
use indicatif::{ProgressBar, ProgressStyle};

use cc26x0_sbl::{util, Device, Notifier};

fn main() -> Result<()> {
    #[cfg(feature = "pretty-env-logger")]
    pretty_env_logger::init_custom_env("CC26X0_SBL_PROG_LOG");
    #[cfg(not(feature = "pretty-env-logger"))]
    env_logger::init_from_env("CC26X0_SBL_PROG_LOG");

    let args = cli().get_matches_safe()?;

    let port_name = args.value_of("PORT").unwrap();
    let firmware_path = args.value_of("FIRMWARE").unwrap();
    let baudrate = args.value_of("baudrate").unwrap().parse::<usize>().map(
        |v| match v {
            110 => serial::BaudRate::Baud110,
            300 => serial::BaudRate::Baud300,
            600 => serial::BaudRate::Baud600,
            1200 => serial::BaudRate::Baud1200,
            2400 => serial::BaudRate::Baud2400,
            4800 => serial::BaudRate::Baud4800,
            9600 => serial::BaudRate::Baud9600,
            19200 => serial::BaudRate::Baud19200,
            38400 => serial::BaudRate::Baud38400,
            57600 => serial::BaudRate::Baud57600,
            115200 => serial::BaudRate::Baud115200,
            n => serial::BaudRate::BaudOther(n),
        },
    )?;

    let mut firmware = fs::read(firmware_path).with_context(|| {
        format!("Couldn't read firmware file `{}`", firmware_path)
    })?;
    if firmware.is_empty() {
        bail!("Firmware file `{}` is empty", firmware_path);
    }
    // The flash download command requires a word-multiple byte count.
    while firmware.len() % 4 != 0 {
        firmware.push(0xFF);
    }

    log::info!("Opening serial port `{}`", port_name);
    let mut port = serial::open(port_name).with_context(|| {
        format!("Couldn't open serial port `{}`", port_name)
    })?;

    let mut settings = cc26x0_sbl::port_settings();
    settings.baud_rate = baudrate;

    port.set_timeout(Duration::from_millis(200))?;
    port.configure(&settings)?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>12} [{bar:40}] {percent:>3}%")
            .progress_chars("=> "),
    );

    let mut device = Device::with_notifier(
        port,
        Box::new(ProgressNotifier { bar: bar.clone() }),
    );

    log::info!("Initializing communications with the device");
    device
        .detect_auto_baud()
        .context("Failed to synchronize with the bootloader")?;

    if !device.ping()? {
        bail!("Ping command wasn't acknowledged");
    }

    let chip_id = device
        .read_device_id()
        .context("Couldn't read the device ID")?;
    println!(
        "Device ID: {:#010X} ({:?})",
        chip_id,
        device.revision().unwrap()
    );

    let flash_size = device
        .read_flash_size()
        .context("Couldn't read flash size")?;
    let ram_size = device.read_ram_size().context("Couldn't read RAM size")?;
    println!("Flash: {} K, RAM: {} K", flash_size / 1024, ram_size / 1024);

    if firmware.len() as u32 > flash_size {
        bail!(
            "Firmware is {} bytes but the device only has {} bytes of flash",
            firmware.len(),
            flash_size
        );
    }

    let firmware_crc = util::crc32_like_device(&firmware);
    log::debug!("Firmware CRC32: {:#010X}", firmware_crc);

    let address = device.flash_base();

    bar.set_message("Erasing");
    device
        .erase_flash_range(address, firmware.len() as u32)
        .context("Couldn't erase flash")?;

    bar.set_message("Writing");
    device
        .write_flash_range(address, &firmware)
        .context("Couldn't write firmware to flash")?;

    bar.set_message("Verifying");
    let device_crc = device
        .calculate_crc32(address, firmware.len() as u32)
        .context("Couldn't read back the flash CRC32")?;
    bar.finish_and_clear();

    if device_crc != firmware_crc {
        bail!(
            "CRC32 mismatch after flashing: device reports {:#010X}, \
             firmware file is {:#010X}",
            device_crc,
            firmware_crc
        );
    }

    device.reset().context("Couldn't reset the device")?;

    println!(
        "Flashed {} bytes at {:#010X}, CRC32 {:#010X}",
        firmware.len(),
        address,
        firmware_crc
    );

    Ok(())
}

/// Drives the progress bar from the chunked device operations.
struct ProgressNotifier {
    bar: ProgressBar,
}

impl Notifier for ProgressNotifier {
    fn status(&mut self, text: &str, is_error: bool) {
        if is_error {
            log::error!("{}", text);
        } else {
            log::warn!("{}", text);
        }
    }

    fn progress(&mut self, percent: u32) {
        self.bar.set_position(u64::from(percent));
    }
}

fn cli() -> App<'static, 'static> {
    let app = App::new("CC26x0 Serial Bootloader Programmer")
        .usage("cc26x0-sbl-prog [OPTIONS] <PORT> <FIRMWARE>")
        .setting(AppSettings::ColoredHelp)
        .version(crate_version!())
        .author(crate_authors!())
        .about(
            "Flashes a firmware image over the CC26x0 serial bootloader \
             and verifies it by CRC32",
        )
        .arg(
            Arg::with_name("PORT")
                .required(true)
                .takes_value(true)
                .help("Serial port connected to the device"),
        )
        .arg(
            Arg::with_name("FIRMWARE")
                .required(true)
                .takes_value(true)
                .help("Firmware image to flash"),
        )
        .arg(
            Arg::with_name("baudrate")
                .long("baudrate")
                .short("b")
                .takes_value(true)
                .default_value("115200")
                .help("Serial port baudrate"),
        );

    // When double clicking the binary the binary will be paused. Useful on
    // windows, since the Console window will be closed inmediately.
    #[cfg(windows)]
    let app = app.setting(AppSettings::WaitOnError);

    app
}
