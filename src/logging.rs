// Copyright (c) 2025 Syswonder
// hvisor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//     http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR
// FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.
//
// Syswonder Website:
//      https://www.syswonder.org
//
// Authors:
//
use core::fmt::{self, Write};

use log::{self, Level, LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Byte sink the logger writes to, usually the platform UART.
pub type ConsolePutchar = fn(u8);

static PRINT_LOCK: Mutex<()> = Mutex::new(());
static CONSOLE: Once<ConsolePutchar> = Once::new();
static LOGGER_INIT: Once<()> = Once::new();

struct ConsoleWriter;

impl Write for ConsoleWriter {
    #[cfg(not(test))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let Some(putchar) = CONSOLE.get() else {
            return Ok(());
        };
        for c in s.bytes() {
            match c {
                b'\n' => {
                    putchar(b'\r');
                    putchar(b'\n');
                }
                _ => putchar(c),
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match CONSOLE.get() {
            Some(putchar) => s.bytes().for_each(|c| putchar(c)),
            None => std::print!("{}", s),
        }
        Ok(())
    }
}

fn print(args: fmt::Arguments) {
    let _locked = PRINT_LOCK.lock();
    // Nothing useful can be done if the console itself fails.
    let _ = ConsoleWriter.write_fmt(args);
}

macro_rules! with_color {
    ($color_code:expr, $($arg:tt)*) => {{
        format_args!("\u{1B}[{}m{}\u{1B}[m", $color_code as u8, format_args!($($arg)*))
    }};
}

#[repr(u8)]
#[allow(dead_code)]
enum ColorCode {
    Black = 30,
    Red = 31,
    Green = 32,
    Yellow = 33,
    Blue = 34,
    Magenta = 35,
    Cyan = 36,
    White = 37,
    BrightBlack = 90,
    BrightRed = 91,
    BrightGreen = 92,
    BrightYellow = 93,
    BrightBlue = 94,
    BrightMagenta = 95,
    BrightCyan = 96,
    BrightWhite = 97,
}

fn max_level() -> LevelFilter {
    match option_env!("LOG") {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Install the console logger. Safe to call more than once, the first console wins.
pub fn init(putchar: Option<ConsolePutchar>) {
    if let Some(putchar) = putchar {
        CONSOLE.call_once(|| putchar);
    }
    LOGGER_INIT.call_once(|| {
        static LOGGER: SimpleLogger = SimpleLogger;
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(max_level());
        }
    });
}

struct SimpleLogger;

impl SimpleLogger {
    fn print(
        &self,
        level: Level,
        line: u32,
        target: &str,
        cpu_id: usize,
        level_color: ColorCode,
        args_color: ColorCode,
        record: &Record,
    ) {
        print(with_color!(
            ColorCode::White,
            "[{} {}] {} {}\n",
            with_color!(level_color, "{:<5}", level),
            with_color!(ColorCode::White, "{}", cpu_id),
            with_color!(ColorCode::White, "({}:{})", target, line),
            with_color!(args_color, "{}", record.args()),
        ));
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = record.level();
        let line = record.line().unwrap_or(0);
        let target = record.file().unwrap_or("");
        let cpu_id = crate::arch::cpu::this_cpu_id();
        let level_color = match level {
            Level::Error => ColorCode::BrightRed,
            Level::Warn => ColorCode::BrightYellow,
            Level::Info => ColorCode::BrightGreen,
            Level::Debug => ColorCode::BrightCyan,
            Level::Trace => ColorCode::BrightBlack,
        };
        let args_color = match level {
            Level::Error => ColorCode::Red,
            Level::Warn => ColorCode::Yellow,
            Level::Info => ColorCode::Green,
            Level::Debug => ColorCode::Cyan,
            Level::Trace => ColorCode::BrightBlack,
        };
        self.print(
            level,
            line,
            target,
            cpu_id,
            level_color,
            args_color,
            record,
        );
    }

    fn flush(&self) {}
}
