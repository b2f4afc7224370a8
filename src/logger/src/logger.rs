use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::{Level, LevelFilter};
use env_logger::{Builder, Env, fmt::Color};
use std::io::Write;
use once_cell::sync::OnceCell;

static INSTANCE: OnceCell<Logger> = OnceCell::new();

/// Process-wide logging front-end.
///
/// Wraps an `env_logger` builder so that progress bars and log records share
/// the terminal without clobbering each other. Verbosity is driven by the
/// number of `-v` flags on the command line, and may be overriden through the
/// `SPRIG_LOG` environment variable.
#[derive(Debug)]
pub struct Logger {
    multi_pg: MultiProgress,
}

impl Logger {
    pub fn init(verbosity: u8) {
        let log_level = Self::u8_to_loglevel(verbosity);
        let env = Env::default().filter("SPRIG_LOG");

        let logger = Builder::new().filter_level(log_level)
            .format(|buf, record| {
                // Errors get a file:line traceback and brighter text.
                let (traceback, intense) = if record.level() == Level::Error {
                    (format!("(@ {}:{}) ", record.file().unwrap_or("unknown"), record.line().unwrap_or(0)), true)
                } else {
                    (String::new(), false)
                };

                let mut arg_style = buf.style();
                arg_style.set_intense(intense);

                let mut level_style = buf.style();
                let color = match record.level() {
                    Level::Error => Color::Red,
                    Level::Warn  => Color::Yellow,
                    Level::Info  => Color::Green,
                    Level::Debug => Color::Blue,
                    Level::Trace => Color::Cyan,
                };
                level_style.set_color(color).set_bold(true);

                writeln!(
                    buf,
                    "[{} {: <5}] {traceback}{}",
                    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                    level_style.value(record.level()),
                    arg_style.value(record.args())
                )
            })
            .parse_env(env)
            .build();

        // Progress bar support.
        let multi_pg = MultiProgress::new();
        LogWrapper::new(multi_pg.clone(), logger)
            .try_init()
            .expect("Failed to wrap logger with multiprogress");
        INSTANCE.set(Self { multi_pg }).expect("Logger was already initialized");
    }

    fn u8_to_loglevel(verbosity: u8) -> LevelFilter {
        match verbosity {
            0           => LevelFilter::Error,
            1           => LevelFilter::Warn,
            2           => LevelFilter::Info,
            3           => LevelFilter::Debug,
            4..=u8::MAX => LevelFilter::Trace,
        }
    }

    pub fn set_level(verbosity: u8) {
        log::set_max_level(Self::u8_to_loglevel(verbosity));
    }

    /// Access the global progress-bar registry. Any bar attached here is
    /// redrawn below in-flight log records.
    pub fn multi() -> &'static MultiProgress {
        &INSTANCE.get().expect("Uninitialized").multi_pg
    }

    /// As [`Logger::multi`], but usable before (or without) `init`.
    pub fn try_multi() -> Option<&'static MultiProgress> {
        INSTANCE.get().map(|logger| &logger.multi_pg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level() {
        Logger::init(0);
        for level in 0..u8::MAX {
            Logger::set_level(level);

            let expected_level = match level {
                0           => LevelFilter::Error,
                1           => LevelFilter::Warn,
                2           => LevelFilter::Info,
                3           => LevelFilter::Debug,
                4..=u8::MAX => LevelFilter::Trace,
            };

            assert_eq!(log::max_level(), expected_level);
        }
    }
}
