//! Append-only engine log.
//!
//! The engine reports parse warnings, gateway diagnostics and reconciliation
//! failures here. Appends are fire-and-forget through a channel to a writer
//! thread; a full or dead sink never blocks or fails the caller.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::{self, Sender};

use chrono::Local;

#[derive(Clone)]
pub struct Log {
    tx: Option<Sender<String>>,
}

impl Log {
    /// Open (creating if needed) an append-mode log file with a background
    /// writer thread. Falls back to a disabled sink if the file cannot be
    /// opened.
    pub fn to_file(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("[log] cannot open {}: {e}", path.display());
                return Self::disabled();
            }
        };

        let (tx, rx) = mpsc::channel::<String>();
        std::thread::spawn(move || {
            let mut file = file;
            while let Ok(line) = rx.recv() {
                let _ = file.write_all(line.as_bytes());
                let _ = file.flush();
            }
        });
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything. Used by tests and as the open-failure
    /// fallback.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Append one entry. Never blocks, never fails.
    pub fn append(&self, category: &str, file: &str, message: &str) {
        let Some(tx) = &self.tx else { return };
        let timestamp = Local::now().format("%Y:%m:%d %H:%M:%S%.6f%z");
        let line = format!("{timestamp} [{category}]:\n  SourceFile: {file}\n  {message}\n");
        let _ = tx.send(line);
    }
}
