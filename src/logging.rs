// Logging contract shared by every backend component
//
// Components never talk to a sink directly. They call `Logger::log` with a
// pipe name, a domain and a severity; what happens to the message after that
// is up to the implementation. The default forwards to the `log` facade so
// whatever the binary installs (env_logger) receives it.

use std::fmt;

/// Pipe used by everything under `backend`.
pub const RENDERING_PIPE: &str = "rendering";

/// Which engine subsystem a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Physics,
    User,
    Rendering,
}

/// How bad it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Domain::Physics => "PHYSICS",
            Domain::User => "USER",
            Domain::Rendering => "RENDERING",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// Log sink used by the device, swapchain and builders.
///
/// Implementations must contain their own I/O failures: `log` has no return
/// value and must never panic or block the caller because a sink is broken.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str, pipe: &str, domain: Domain, severity: Severity);

    /// Shorthand for the rendering pipe/domain pair
    fn rendering(&self, severity: Severity, message: &str) {
        self.log(message, RENDERING_PIPE, Domain::Rendering, severity);
    }
}

/// Forwards to the `log` crate. The pipe name becomes the log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateLogger;

impl Logger for LogCrateLogger {
    fn log(&self, message: &str, pipe: &str, domain: Domain, severity: Severity) {
        match severity {
            Severity::Info => log::info!(target: pipe, "[{}] {}", domain, message),
            Severity::Warning => log::warn!(target: pipe, "[{}] {}", domain, message),
            Severity::Error => log::error!(target: pipe, "[{}] {}", domain, message),
            Severity::Fatal => log::error!(target: pipe, "[{}] FATAL: {}", domain, message),
        }
    }
}
