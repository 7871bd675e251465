use ng_devhub_error::{HubError, HubResult};
use ng_devhub_models::settings::Log;
use std::{
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{subscriber::set_global_default, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::DynFilterFn,
    fmt::{self},
    layer::SubscriberExt,
    Layer, Registry,
};

pub struct Logger {
    level: Arc<Mutex<Level>>,
    _file_guard: Option<WorkerGuard>,
}

#[inline]
fn lock_level(level: &Mutex<Level>) -> MutexGuard<'_, Level> {
    level.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Logger {
    pub fn new(level: Option<Level>) -> Self {
        Logger {
            level: Arc::new(Mutex::new(level.unwrap_or(Level::INFO))),
            _file_guard: None,
        }
    }

    /// Builds a logger from the `[log]` settings section.
    pub fn from_settings(log: &Log) -> HubResult<Self> {
        let level = Level::from_str(&log.level)
            .map_err(|_| HubError::Config(format!("invalid log level: {}", log.level)))?;
        Ok(Self::new(Some(level)))
    }

    /// Sets the new logging level; takes effect for both layers immediately.
    #[inline]
    pub fn set_level(&self, new_level: Level) {
        *lock_level(&self.level) = new_level;
    }

    #[inline]
    pub fn get_level(&self) -> Level {
        *lock_level(&self.level)
    }

    /// Initializes the logger
    ///
    /// This function sets up logging output to both the console and a rolling log file,
    /// with filtering based on log levels.
    pub fn initialize(&mut self) -> HubResult<()> {
        // Create a daily rolling file appender for log files
        let file_appender = rolling::daily("logs", "devhub.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        self._file_guard = Some(guard);

        let console_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| metadata.level() <= &*lock_level(&level))
        };

        let file_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| metadata.level() <= &*lock_level(&level))
        };

        let console_layer = {
            #[cfg(debug_assertions)]
            let layer = fmt::layer()
                .pretty()
                .with_writer(std::io::stdout)
                .with_file(true)
                .with_line_number(true);

            #[cfg(not(debug_assertions))]
            let layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(false)
                .with_line_number(false);

            layer.with_filter(console_filter)
        };

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_filter(file_filter);

        let subscriber = Registry::default().with(console_layer).with(file_layer);

        set_global_default(subscriber).map_err(|_| HubError::from("Failed to set logger"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_from_settings() {
        let logger = Logger::from_settings(&Log {
            level: "debug".into(),
        })
        .unwrap();
        assert_eq!(logger.get_level(), Level::DEBUG);
        logger.set_level(Level::WARN);
        assert_eq!(logger.get_level(), Level::WARN);
        assert!(Logger::from_settings(&Log {
            level: "loud".into()
        })
        .is_err());
    }
}
