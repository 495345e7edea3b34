//! Background loading of capture files.
//!
//! Decoding and tree building can take a while on large dumps, so they run
//! on a worker thread. The caller polls [`BackgroundLoader::progress`],
//! may cancel with [`BackgroundLoader::interrupt`], and joins for the
//! finished [`ProfileReport`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use profile_format::{decode, decode_reader};
use tracing::debug;

use crate::tree::{build_report_with, ProfileReport};
use crate::{ReaderError, Result};

// Reading and decoding the container is charged this share of the
// progress bar; tree building fills the rest.
const DECODE_SHARE: u8 = 30;

pub struct BackgroundLoader {
    handle: Option<thread::JoinHandle<Result<ProfileReport>>>,
    progress: Arc<AtomicU8>,
    done: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
}

impl BackgroundLoader {
    /// Load and process a capture file on a worker thread.
    pub fn spawn_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::spawn(move || {
            debug!(path = %path.display(), "loading capture file");
            Ok(decode_reader(std::fs::File::open(&path)?)?)
        })
    }

    /// Process an already in-memory container, e.g. a network capture.
    pub fn spawn_bytes(bytes: Vec<u8>) -> Self {
        Self::spawn(move || Ok(decode(&bytes)?))
    }

    fn spawn(
        produce: impl FnOnce() -> Result<profile_format::CaptureDump> + Send + 'static,
    ) -> Self {
        let progress = Arc::new(AtomicU8::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let interrupt = Arc::new(AtomicBool::new(false));

        let worker_progress = progress.clone();
        let worker_done = done.clone();
        let worker_interrupt = interrupt.clone();
        let handle = thread::spawn(move || {
            let result = Self::run(produce, &worker_progress, &worker_interrupt);
            worker_done.store(true, Ordering::Release);
            result
        });

        BackgroundLoader {
            handle: Some(handle),
            progress,
            done,
            interrupt,
        }
    }

    fn run(
        produce: impl FnOnce() -> Result<profile_format::CaptureDump>,
        progress: &AtomicU8,
        interrupt: &AtomicBool,
    ) -> Result<ProfileReport> {
        if interrupt.load(Ordering::Relaxed) {
            return Err(ReaderError::Interrupted);
        }
        let dump = produce()?;
        progress.store(DECODE_SHARE, Ordering::Relaxed);
        if interrupt.load(Ordering::Relaxed) {
            return Err(ReaderError::Interrupted);
        }

        build_report_with(dump, &mut |tree_percent| {
            let scaled =
                DECODE_SHARE + (tree_percent as u16 * (100 - DECODE_SHARE) as u16 / 100) as u8;
            progress.store(scaled, Ordering::Relaxed);
            !interrupt.load(Ordering::Relaxed)
        })
        .map(|report| {
            progress.store(100, Ordering::Relaxed);
            report
        })
    }

    /// Completion percentage, 0 to 100.
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Request cancellation; the worker notices at its next checkpoint and
    /// [`join`] returns [`ReaderError::Interrupted`].
    ///
    /// [`join`]: BackgroundLoader::join
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// Wait for the worker and take its result. Returns an IO error if the
    /// worker panicked.
    pub fn join(mut self) -> Result<ProfileReport> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                ReaderError::Io(std::io::Error::other("loader worker panicked"))
            })?,
            None => Err(ReaderError::Interrupted),
        }
    }
}

impl Drop for BackgroundLoader {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.interrupt.store(true, Ordering::Relaxed);
            let _ = handle.join();
        }
    }
}
