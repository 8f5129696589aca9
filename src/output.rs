use serde::{Deserialize, Serialize};

/// How chatty a session is. Ranks line up with [`Threshold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Silent = 1,
    Terse = 2,
    #[default]
    Normal = 3,
    Verbose = 4,
}

/// Minimum verbosity a line needs before it is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Threshold {
    Always = 1,
    UnlessSilent = 2,
    Normal = 3,
    IfVerbose = 4,
}

impl Verbosity {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Verbosity::Silent),
            2 => Some(Verbosity::Terse),
            3 => Some(Verbosity::Normal),
            4 => Some(Verbosity::Verbose),
            _ => None,
        }
    }

    pub fn admits(self, threshold: Threshold) -> bool {
        self as u8 >= threshold as u8
    }
}

/// Destination for session messages.
pub trait LogSink {
    fn write(&self, message: &str, threshold: Threshold);
}

impl<F> LogSink for F
where
    F: Fn(&str, Threshold),
{
    fn write(&self, message: &str, threshold: Threshold) {
        self(message, threshold)
    }
}

/// Verbosity level plus sink, handed to every core operation.
pub struct OutputWriter {
    level: Verbosity,
    sink: Box<dyn LogSink>,
}

impl OutputWriter {
    pub fn new(level: Verbosity, sink: impl LogSink + 'static) -> Self {
        Self { level, sink: Box::new(sink) }
    }

    /// Drops everything.
    pub fn discard() -> Self {
        Self::new(Verbosity::Silent, |_: &str, _: Threshold| {})
    }

    pub fn level(&self) -> Verbosity {
        self.level
    }

    /// Diagnostic line, only shown when verbose.
    pub fn line(&self, message: impl AsRef<str>) {
        self.write_line(message, Threshold::IfVerbose)
    }

    pub fn write_line(&self, message: impl AsRef<str>, threshold: Threshold) {
        if self.level.admits(threshold) {
            self.sink.write(message.as_ref(), threshold);
        }
    }
}
