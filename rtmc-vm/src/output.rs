//! Debug output sinks.
//!
//! `DBG_PRINT`/`DBG_PRINTF` write lines through a sink so embedding code
//! and tests can capture program output instead of scraping stdout.

use std::sync::Mutex;

/// Destination of the program's debug prints.
pub trait OutputSink: Send + Sync {
    fn print(&self, line: &str);
}

/// Default sink: one line per print on stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn print(&self, line: &str) {
        println!("{line}");
    }
}

/// Test sink collecting every printed line.
#[derive(Debug, Default)]
pub struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines printed so far, in order.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("sink lock").clone()
    }
}

impl OutputSink for CaptureSink {
    fn print(&self, line: &str) {
        self.lines.lock().expect("sink lock").push(line.to_owned());
    }
}
