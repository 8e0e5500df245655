//! `log` backend for boards without an allocator.
//!
//! Records are rendered as `LEVEL [target] message` with ANSI colors and
//! CRLF line endings, then pushed to a console sink supplied by the board
//! (usually a UART write routine).

use core::fmt::{self, Display, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};
use owo_colors::OwoColorize;
use unicode_segmentation::UnicodeSegmentation;

/// Console output routine.
pub type Sink = fn(&str);

struct Inner {
    sink: Option<Sink>,
}

struct FsLogger {
    inner: spin::Mutex<Inner>,
}

static LOGGER: FsLogger = FsLogger {
    inner: spin::Mutex::new(Inner { sink: None }),
};

impl Log for FsLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let inner = self.inner.lock();
        if let Some(sink) = inner.sink {
            let _ = write_record(&mut SinkWriter(sink), record);
        }
    }

    fn flush(&self) {}
}

/// Install the logger. Fails if another logger is already set.
pub fn init(sink: Sink, level: LevelFilter) -> Result<(), log::SetLoggerError> {
    LOGGER.inner.lock().sink = Some(sink);
    log::set_max_level(level);
    log::set_logger(&LOGGER)
}

/// Render one record, newline included, into `out`.
pub fn write_record<W: Write>(out: &mut W, record: &Record) -> fmt::Result {
    let mut out = WriterWithCr::new(out);
    let level = record.level();
    write_with_color(
        &mut out,
        match level {
            Level::Error => Color::BrightRed,
            Level::Warn  => Color::BrightYellow,
            Level::Info  => Color::BrightBlue,
            Level::Debug => Color::BrightCyan,
            Level::Trace => Color::BrightMagenta,
        },
        format_args!("{level:5} "),
    )?;
    write_with_color(&mut out, Color::Gray, format_args!("[{}] ", record.target()))?;
    write_with_color(&mut out, Color::Default, record.args())?;
    write_with_color(&mut out, Color::Default, "\n")
}

fn write_with_color<W: Write>(out: &mut W, color: Color, string: impl Display) -> fmt::Result {
    let string: &dyn Display = match color {
        Color::Default       => &string,
        Color::Gray          => &string.dimmed(),
        Color::BrightRed     => &string.bright_red(),
        Color::BrightYellow  => &string.bright_yellow(),
        Color::BrightBlue    => &string.bright_blue(),
        Color::BrightCyan    => &string.bright_cyan(),
        Color::BrightMagenta => &string.bright_magenta(),
    };
    write!(out, "{string}")
}

struct SinkWriter(Sink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

/// Serial consoles want `\r\n`.
struct WriterWithCr<T> {
    writer: T,
}

impl<T> WriterWithCr<T> {
    pub const fn new(writer: T) -> Self {
        Self { writer }
    }
}

impl<T: Write> Write for WriterWithCr<T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.graphemes(true) {
            match c {
                "\n" => self.writer.write_str("\r\n")?,
                s => self.writer.write_str(s)?,
            }
        }
        Ok(())
    }
}

enum Color {
    Default,
    Gray,
    BrightRed,
    BrightYellow,
    BrightBlue,
    BrightCyan,
    BrightMagenta,
}
