//! Reusable byte buffers and compression codecs
//!
//! One `Pool` is built per service instance and shared (`Arc<Pool>`) by every
//! relay and wrapper, so high connection churn does not turn into allocator
//! churn. Misses simply allocate; nothing here can fail.

use flate2::{Compress, Compression, Decompress};
use std::sync::Mutex;
use tracing::trace;

/// Lower bounds of the buffer size classes, largest first.
/// Anything smaller than the last bound lands in the default class.
pub const SIZE_CLASSES: [usize; 4] = [16 * 1024, 5 * 1024, 2 * 1024, 1024];

/// Maximum number of idle items kept per free list
const MAX_IDLE_PER_CLASS: usize = 256;

/// Buffer and codec free lists
pub struct Pool {
    buffers: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES.len() + 1],
    compressors: Mutex<Vec<Compress>>,
    decompressors: Mutex<Vec<Decompress>>,
    compression: Compression,
}

impl Pool {
    pub fn new() -> Self {
        Self::with_compression(Compression::fast())
    }

    /// Create a pool whose compressors use the given level
    pub fn with_compression(compression: Compression) -> Self {
        Self {
            buffers: Default::default(),
            compressors: Mutex::new(Vec::new()),
            decompressors: Mutex::new(Vec::new()),
            compression,
        }
    }

    fn class_for(size: usize) -> usize {
        SIZE_CLASSES
            .iter()
            .position(|&bound| size >= bound)
            .unwrap_or(SIZE_CLASSES.len())
    }

    /// Get a buffer of exactly `size` bytes.
    ///
    /// The contents are unspecified; callers only ever read back what they
    /// wrote into it.
    pub fn acquire_buf(&self, size: usize) -> Vec<u8> {
        let class = Self::class_for(size);
        let pooled = match self.buffers[class].lock() {
            Ok(mut list) => list.pop(),
            Err(_) => None,
        };

        match pooled {
            Some(mut buf) if buf.capacity() >= size => {
                buf.resize(size, 0);
                buf
            }
            _ => {
                trace!("buffer pool miss for {} bytes", size);
                vec![0u8; size]
            }
        }
    }

    /// Return a buffer to the class matching its capacity
    pub fn release_buf(&self, buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        let class = Self::class_for(buf.capacity());
        if let Ok(mut list) = self.buffers[class].lock() {
            if list.len() < MAX_IDLE_PER_CLASS {
                list.push(buf);
            }
        }
    }

    /// Get a raw-deflate compressor in its initial state
    pub fn acquire_compressor(&self) -> Compress {
        let pooled = match self.compressors.lock() {
            Ok(mut list) => list.pop(),
            Err(_) => None,
        };
        match pooled {
            Some(mut compressor) => {
                compressor.reset();
                compressor
            }
            None => Compress::new(self.compression, false),
        }
    }

    pub fn release_compressor(&self, compressor: Compress) {
        if let Ok(mut list) = self.compressors.lock() {
            if list.len() < MAX_IDLE_PER_CLASS {
                list.push(compressor);
            }
        }
    }

    /// Get a raw-deflate decompressor in its initial state
    pub fn acquire_decompressor(&self) -> Decompress {
        let pooled = match self.decompressors.lock() {
            Ok(mut list) => list.pop(),
            Err(_) => None,
        };
        match pooled {
            Some(mut decompressor) => {
                decompressor.reset(false);
                decompressor
            }
            None => Decompress::new(false),
        }
    }

    pub fn release_decompressor(&self, decompressor: Decompress) {
        if let Ok(mut list) = self.decompressors.lock() {
            if list.len() < MAX_IDLE_PER_CLASS {
                list.push(decompressor);
            }
        }
    }

    /// Number of idle buffers across all classes
    pub fn idle_buffers(&self) -> usize {
        self.buffers
            .iter()
            .map(|list| list.lock().map(|l| l.len()).unwrap_or(0))
            .sum()
    }

    /// Number of idle (compressor, decompressor) instances
    pub fn idle_codecs(&self) -> (usize, usize) {
        let compressors = self.compressors.lock().map(|l| l.len()).unwrap_or(0);
        let decompressors = self.decompressors.lock().map(|l| l.len()).unwrap_or(0);
        (compressors, decompressors)
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{FlushCompress, FlushDecompress};
    use std::sync::Arc;

    #[test]
    fn test_size_classes() {
        assert_eq!(Pool::class_for(64 * 1024), 0);
        assert_eq!(Pool::class_for(16 * 1024), 0);
        assert_eq!(Pool::class_for(8 * 1024), 1);
        assert_eq!(Pool::class_for(2048), 2);
        assert_eq!(Pool::class_for(1500), 3);
        assert_eq!(Pool::class_for(512), 4);
    }

    #[test]
    fn test_acquire_returns_requested_len() {
        let pool = Pool::new();
        let buf = pool.acquire_buf(3000);
        assert_eq!(buf.len(), 3000);
    }

    #[test]
    fn test_released_buffer_is_reused() {
        let pool = Pool::new();

        let buf = pool.acquire_buf(16 * 1024);
        let ptr = buf.as_ptr();
        pool.release_buf(buf);
        assert_eq!(pool.idle_buffers(), 1);

        let again = pool.acquire_buf(16 * 1024);
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(pool.idle_buffers(), 0);
    }

    #[test]
    fn test_too_small_pooled_buffer_is_replaced() {
        let pool = Pool::new();

        // 16KiB lands in the top class; a 32KiB request from the same class
        // must not get the short buffer back
        pool.release_buf(vec![0u8; 16 * 1024]);
        let buf = pool.acquire_buf(32 * 1024);
        assert_eq!(buf.len(), 32 * 1024);
    }

    #[test]
    fn test_idle_list_is_bounded() {
        let pool = Pool::new();
        for _ in 0..(MAX_IDLE_PER_CLASS + 10) {
            pool.release_buf(vec![0u8; 1024]);
        }
        assert_eq!(pool.idle_buffers(), MAX_IDLE_PER_CLASS);
    }

    #[test]
    fn test_codec_reset_on_reuse() {
        let pool = Pool::new();

        // Leave a compressor mid-stream, then reuse it for a fresh stream
        let mut compressor = pool.acquire_compressor();
        let mut scratch = Vec::with_capacity(256);
        compressor
            .compress_vec(b"stale", &mut scratch, FlushCompress::None)
            .unwrap();
        pool.release_compressor(compressor);
        assert_eq!(pool.idle_codecs(), (1, 0));

        let mut compressor = pool.acquire_compressor();
        assert_eq!(compressor.total_in(), 0);

        let mut compressed = Vec::with_capacity(256);
        compressor
            .compress_vec(b"fresh", &mut compressed, FlushCompress::Finish)
            .unwrap();

        let mut decompressor = pool.acquire_decompressor();
        let mut out = Vec::with_capacity(256);
        decompressor
            .decompress_vec(&compressed, &mut out, FlushDecompress::Finish)
            .unwrap();
        assert_eq!(out, b"fresh");
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(Pool::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        let buf = pool.acquire_buf(1024 * (1 + (i + j) % 20));
                        pool.release_buf(buf);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.idle_buffers() > 0);
    }
}
