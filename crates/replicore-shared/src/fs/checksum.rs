//! Incremental control-sum engines for replica verification.
//!
//! The control sum is the byte sum of a file's content modulo 2^64,
//! reported in its decimal string form. It is a consistency check for the
//! replica census, not an integrity mechanism.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::errors::{ReplicaError, ReplicaResult};

/// Default number of bytes read per `execute()` step
pub const DEFAULT_RECORD_SIZE_BYTES: usize = 1024 * 1024;

/// Hard cap on the record size
pub const MAX_RECORD_SIZE_BYTES: usize = 1024 * 1024 * 1024;

fn validate_record_size(record_size_bytes: usize) -> ReplicaResult<()> {
    if record_size_bytes == 0 || record_size_bytes > MAX_RECORD_SIZE_BYTES {
        return Err(ReplicaError::invalid_argument(format!(
            "record size {record_size_bytes} outside (0, {MAX_RECORD_SIZE_BYTES}]"
        )));
    }
    Ok(())
}

/// Incrementally computes the control sum of one file.
///
/// Each call to [`Self::execute`] reads up to the record size from the file
/// and folds the bytes into the running sum. The method returns `true` once
/// the whole file has been consumed.
#[derive(Debug)]
pub struct FileCsComputeEngine {
    path: PathBuf,
    file: File,
    buf: Vec<u8>,
    bytes: u64,
    cs: u64,
    finished: bool,
}

impl FileCsComputeEngine {
    pub fn new(path: impl AsRef<Path>, record_size_bytes: usize) -> ReplicaResult<Self> {
        validate_record_size(record_size_bytes)?;
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(ReplicaError::invalid_argument("empty file name"));
        }
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file,
            buf: vec![0u8; record_size_bytes],
            bytes: 0,
            cs: 0,
            finished: false,
        })
    }

    /// Read the next record. Returns `true` when the file is fully consumed.
    pub fn execute(&mut self) -> ReplicaResult<bool> {
        if self.finished {
            return Err(ReplicaError::illegal_state(format!(
                "attempt to read '{}' past its end",
                self.path.display()
            )));
        }
        let read = self.file.read(&mut self.buf)?;
        if read == 0 {
            self.finished = true;
            return Ok(true);
        }
        for byte in &self.buf[..read] {
            self.cs = self.cs.wrapping_add(u64::from(*byte));
        }
        self.bytes += read as u64;
        Ok(false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// The running (or, after completion, final) control sum
    pub fn cs(&self) -> u64 {
        self.cs
    }
}

/// Result of a completed per-file computation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileCsResult {
    pub path: PathBuf,
    pub bytes: u64,
    pub cs: u64,
}

/// Drives [`FileCsComputeEngine`] over a sequence of files, one record per
/// `execute()` step.
#[derive(Debug)]
pub struct MultiFileCsComputeEngine {
    pending: std::vec::IntoIter<PathBuf>,
    record_size_bytes: usize,
    current: Option<FileCsComputeEngine>,
    results: Vec<FileCsResult>,
}

impl MultiFileCsComputeEngine {
    pub fn new(paths: Vec<PathBuf>, record_size_bytes: usize) -> ReplicaResult<Self> {
        validate_record_size(record_size_bytes)?;
        Ok(Self {
            pending: paths.into_iter(),
            record_size_bytes,
            current: None,
            results: Vec::new(),
        })
    }

    /// Process one record of the current file. Returns `true` once every
    /// file has been consumed.
    pub fn execute(&mut self) -> ReplicaResult<bool> {
        if self.current.is_none() {
            match self.pending.next() {
                None => return Ok(true),
                Some(path) => {
                    self.current = Some(FileCsComputeEngine::new(path, self.record_size_bytes)?);
                }
            }
        }
        let engine = self.current.as_mut().expect("engine was just installed");
        if engine.execute()? {
            let engine = self.current.take().expect("current file is present");
            self.results.push(FileCsResult {
                path: engine.path.clone(),
                bytes: engine.bytes,
                cs: engine.cs,
            });
            // Completion is only reported once the file list is exhausted
            return Ok(self.pending.len() == 0);
        }
        Ok(false)
    }

    /// Per-file results of files consumed so far
    pub fn results(&self) -> &[FileCsResult] {
        &self.results
    }
}

/// Compute the control sum of a single file in one blocking call
pub fn compute_cs(path: impl AsRef<Path>, record_size_bytes: usize) -> ReplicaResult<u64> {
    let mut engine = FileCsComputeEngine::new(path, record_size_bytes)?;
    while !engine.execute()? {}
    Ok(engine.cs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).expect("create test file");
        file.write_all(content).expect("write test file");
        path
    }

    #[test]
    fn test_byte_sum_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "data.bin", &[1, 2, 3, 250]);
        assert_eq!(compute_cs(&path, DEFAULT_RECORD_SIZE_BYTES).unwrap(), 256);
    }

    #[test]
    fn test_empty_file_sums_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "empty.bin", b"");
        assert_eq!(compute_cs(&path, 16).unwrap(), 0);
    }

    #[test]
    fn test_incremental_reads_with_small_records() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..=255).collect();
        let path = write_file(&dir, "seq.bin", &content);
        let mut engine = FileCsComputeEngine::new(&path, 7).unwrap();
        let mut steps = 0;
        while !engine.execute().unwrap() {
            steps += 1;
        }
        assert!(steps >= 256 / 7);
        assert_eq!(engine.bytes(), 256);
        assert_eq!(engine.cs(), (0u64..=255).sum::<u64>());
    }

    #[test]
    fn test_record_size_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.bin", b"x");
        assert!(FileCsComputeEngine::new(&path, 0).is_err());
        assert!(FileCsComputeEngine::new(&path, MAX_RECORD_SIZE_BYTES + 1).is_err());
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(FileCsComputeEngine::new("/nonexistent/file.bin", 16).is_err());
    }

    #[test]
    fn test_multi_file_engine() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(&dir, "a.bin", &[10, 20]);
        let b = write_file(&dir, "b.bin", &[30]);
        let mut engine = MultiFileCsComputeEngine::new(vec![a.clone(), b.clone()], 1024).unwrap();
        while !engine.execute().unwrap() {}
        let results = engine.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].path, a);
        assert_eq!(results[0].cs, 30);
        assert_eq!(results[1].path, b);
        assert_eq!(results[1].cs, 30);
        assert_eq!(results[1].bytes, 1);
    }

    #[test]
    fn test_multi_file_engine_empty_list() {
        let mut engine = MultiFileCsComputeEngine::new(vec![], 1024).unwrap();
        assert!(engine.execute().unwrap());
    }
}
