//! Display surfaces that frames are rendered to.

use crate::paginate::{DisplayFrame, DisplayLimits};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// A character display with fixed dimensions.
///
/// Rendering is synchronous and must not fail from the caller's point of
/// view; implementations log their own I/O errors.
pub trait DisplaySurface: Send {
    fn limits(&self) -> DisplayLimits;

    fn render(&mut self, frame: &DisplayFrame);
}

/// Draws frames to stdout inside a box.
pub struct TerminalDisplay {
    limits: DisplayLimits,
    clear: bool,
}

impl TerminalDisplay {
    pub fn new(limits: DisplayLimits) -> Self {
        Self {
            limits,
            clear: true,
        }
    }

    /// Append frames instead of redrawing in place.
    pub fn without_clear(mut self) -> Self {
        self.clear = false;
        self
    }

    fn draw(&self, frame: &DisplayFrame) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let border = "-".repeat(self.limits.cols);

        if self.clear {
            // Clear screen, cursor home
            write!(out, "\x1b[2J\x1b[H")?;
        }
        writeln!(out, "+{}+", border)?;
        for row in frame.rows() {
            writeln!(out, "|{}|", row)?;
        }
        writeln!(out, "+{}+", border)?;
        out.flush()
    }
}

impl DisplaySurface for TerminalDisplay {
    fn limits(&self) -> DisplayLimits {
        self.limits
    }

    fn render(&mut self, frame: &DisplayFrame) {
        if let Err(e) = self.draw(frame) {
            tracing::warn!("Terminal display write failed: {}", e);
        }
    }
}

/// Writes each frame to a text file, one row per line.
///
/// The file is replaced via rename, so a driver process polling it never
/// sees a half-written frame.
pub struct FileDisplay {
    limits: DisplayLimits,
    path: PathBuf,
}

impl FileDisplay {
    pub fn new(limits: DisplayLimits, path: impl Into<PathBuf>) -> Self {
        Self {
            limits,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn write(&self, frame: &DisplayFrame) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n", frame))?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl DisplaySurface for FileDisplay {
    fn limits(&self) -> DisplayLimits {
        self.limits
    }

    fn render(&mut self, frame: &DisplayFrame) {
        if let Err(e) = self.write(frame) {
            tracing::warn!("Display file {} write failed: {}", self.path.display(), e);
        }
    }
}

/// Keeps every rendered frame in memory. Clones share the same history.
#[derive(Clone)]
pub struct MemoryDisplay {
    limits: DisplayLimits,
    frames: Arc<Mutex<Vec<DisplayFrame>>>,
}

impl MemoryDisplay {
    pub fn new(limits: DisplayLimits) -> Self {
        Self {
            limits,
            frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// All frames rendered so far, oldest first.
    pub fn frames(&self) -> Vec<DisplayFrame> {
        self.frames.lock().clone()
    }

    pub fn last(&self) -> Option<DisplayFrame> {
        self.frames.lock().last().cloned()
    }
}

impl DisplaySurface for MemoryDisplay {
    fn limits(&self) -> DisplayLimits {
        self.limits
    }

    fn render(&mut self, frame: &DisplayFrame) {
        self.frames.lock().push(frame.clone());
    }
}
