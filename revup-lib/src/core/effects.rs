//! Output handling for user-facing messages.
//!
//! `Effects` carries the destination for normal and error output. Commands
//! write through it rather than to `stdout`/`stderr` directly so that tests
//! can capture output and so that suppressed contexts stay silent.

use std::fmt;
use std::sync::{Arc, Mutex};

use console::Style;
use lazy_static::lazy_static;

lazy_static! {
    /// Style for success messages ("Pushed", "Created", etc.).
    pub static ref STYLE_SUCCESS: Style = Style::new().green().bold();

    /// Style for skipped/no-op messages.
    pub static ref STYLE_SKIPPED: Style = Style::new().yellow().bold();

    /// Style for warnings.
    pub static ref STYLE_WARNING: Style = Style::new().yellow();

    /// Style for errors.
    pub static ref STYLE_ERROR: Style = Style::new().red().bold();
}

#[derive(Clone, Debug)]
enum OutputDest {
    Stdout,
    Suppress,
    BufferForTest(Arc<Mutex<Vec<u8>>>),
}

/// Where and how to write user-facing output.
#[derive(Clone, Debug)]
pub struct Effects {
    dest: OutputDest,
    verbose: bool,
}

impl Effects {
    /// Constructor. Writes to stdout/stderr.
    pub fn new() -> Self {
        Effects {
            dest: OutputDest::Stdout,
            verbose: false,
        }
    }

    /// Constructor. Like [`Effects::new`], but also prints every subprocess
    /// invocation and forge request.
    pub fn new_verbose() -> Self {
        Effects {
            dest: OutputDest::Stdout,
            verbose: true,
        }
    }

    /// Constructor for tests: captures all output into the provided buffer.
    pub fn new_from_buffer_for_test(buffer: &Arc<Mutex<Vec<u8>>>) -> Self {
        Effects {
            dest: OutputDest::BufferForTest(Arc::clone(buffer)),
            verbose: false,
        }
    }

    /// Return a copy of these effects which discards all output.
    pub fn suppress(&self) -> Self {
        Effects {
            dest: OutputDest::Suppress,
            verbose: self.verbose,
        }
    }

    /// Whether verbose output was requested.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Get the stream for normal output.
    pub fn get_output_stream(&self) -> OutputStream {
        OutputStream {
            dest: self.dest.clone(),
        }
    }

    /// Get the stream for error/warning output.
    pub fn get_error_stream(&self) -> ErrorStream {
        ErrorStream {
            dest: self.dest.clone(),
        }
    }
}

impl Default for Effects {
    fn default() -> Self {
        Self::new()
    }
}

/// The stream for normal output.
pub struct OutputStream {
    dest: OutputDest,
}

impl fmt::Write for OutputStream {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match &self.dest {
            OutputDest::Stdout => {
                print!("{s}");
            }
            OutputDest::Suppress => {}
            OutputDest::BufferForTest(buffer) => {
                let mut buffer = buffer.lock().expect("Poisoned effects buffer");
                buffer.extend_from_slice(s.as_bytes());
            }
        }
        Ok(())
    }
}

/// The stream for error/warning output.
pub struct ErrorStream {
    dest: OutputDest,
}

impl fmt::Write for ErrorStream {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match &self.dest {
            OutputDest::Stdout => {
                eprint!("{s}");
            }
            OutputDest::Suppress => {}
            OutputDest::BufferForTest(buffer) => {
                let mut buffer = buffer.lock().expect("Poisoned effects buffer");
                buffer.extend_from_slice(s.as_bytes());
            }
        }
        Ok(())
    }
}
