#![allow(dead_code)]

use anyhow::Result;
use data_feed::{Array, Batch};
use rand::Rng;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Installs a test-friendly tracing subscriber once per test binary.
/// Honors `RUST_LOG`, e.g. `RUST_LOG=data_feed=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Random `(image, label)` batch with the given row counts.
pub fn random_images_and_labels(batch_size: usize, image_dim: usize) -> Result<Batch> {
    let mut rng = rand::rng();
    let image = Array::new(
        vec![batch_size, image_dim],
        (0..batch_size * image_dim).map(|_| rng.random::<f32>()).collect(),
    )?;
    let label = Array::new(
        vec![batch_size, 1],
        (0..batch_size).map(|_| rng.random_range(0..10) as f32).collect(),
    )?;
    Ok(Batch::new(vec![image, label]))
}

/// Batch whose single field carries `index` so tests can check ordering.
pub fn indexed_batch(index: usize) -> Batch {
    Batch::new(vec![Array::from_rows(&[[index as f32]]).expect("1x1 array")])
}

/// Reads back the marker written by [`indexed_batch`].
pub fn batch_index(batch: &Batch) -> usize {
    batch.get(0).expect("field 0").data()[0] as usize
}

/// Generator yielding `batch_num` ragged samples (`[[[1, 2], [1]]]`).
pub fn error_sample_generator(batch_num: usize) -> impl Iterator<Item = Result<Batch>> + Send {
    (0..batch_num).map(|_| Batch::from_ragged(vec![vec![vec![1.0, 2.0], vec![1.0]]]))
}

/// Generator that sleeps `delay` before producing each batch.
pub fn slow_batch_generator(
    batch_size: usize,
    batch_num: usize,
    delay: Duration,
) -> impl Iterator<Item = Result<Batch>> + Send {
    (0..batch_num).map(move |_| {
        std::thread::sleep(delay);
        random_images_and_labels(batch_size, 784)
    })
}

/// Consumer-side operator applied to each batch in the training loop.
pub fn relu(array: &Array) -> Vec<f32> {
    array.data().iter().map(|v| v.max(0.0)).collect()
}

/// Whether a process with `pid` still exists (zombies count as existing).
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence and permission.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

struct PullLogFile(PathBuf);

impl Drop for PullLogFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// Counts generator pulls in a temp file, so the count is visible from the
/// test even when the generator runs in a worker process.
#[derive(Clone)]
pub struct PullLog(Arc<PullLogFile>);

impl PullLog {
    pub fn new(tag: &str) -> Result<Self> {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "data_feed-pulls-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        ));
        fs::write(&path, b"")?;
        Ok(Self(Arc::new(PullLogFile(path))))
    }

    /// Appends one pull.
    pub fn record(&self) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.0 .0)?;
        file.write_all(b"+")?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        match fs::read(&self.0 .0) {
            Ok(bytes) => Ok(bytes.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
