/// Callback-based protocol trace logging
///
/// Host applications often need Modbus traffic routed into their own
/// logging pipeline rather than the process-wide `log` facade. A
/// [`CallbackLogger`] forwards packet dumps and interpreted frame
/// summaries to a user-supplied sink, level-filtered; the default logger
/// is disabled and costs nothing.
use std::sync::Arc;

use crate::protocol::{Adu, ModbusFunction};
use crate::utils::format;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that forwards protocol traces to a callback
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
        }
    }

    /// Create a logger with timestamped console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                _ => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(callback) = &self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log raw packet bytes with a direction tag ("TX" / "RX")
    pub fn log_packet(&self, direction: &str, data: &[u8]) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        self.info(&format!(
            "{} packet ({} bytes): {}",
            direction,
            data.len(),
            format::bytes_to_hex(data)
        ));
    }

    /// Log an interpreted frame summary
    pub fn log_frame(&self, direction: &str, adu: &Adu) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let function = match ModbusFunction::from_u8(adu.function) {
            Ok(function) => function.to_string(),
            Err(_) if adu.is_exception() => {
                format!("Exception (0x{:02X})", adu.function)
            }
            Err(_) => format!("Unknown (0x{:02X})", adu.function),
        };
        let transaction = match adu.transaction_id {
            Some(id) => format!(" transaction={id}"),
            None => String::new(),
        };
        self.info(&format!(
            "{} frame: unit={} function={}{} data={}",
            direction,
            adu.unit_id,
            function,
            transaction,
            hex::encode(&adu.data)
        ));
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}
