use std::sync::Mutex;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Freelist of fixed-size byte buffers for the session byte pumps.
///
/// `acquire` always hands out a buffer of exactly the configured size;
/// `release` keeps any buffer whose capacity still covers that size and
/// silently drops smaller ones.
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_BUFFER_SIZE } else { size };
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn acquire(&self) -> Vec<u8> {
        let pooled = {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };
        match pooled {
            Some(mut buf) => {
                buf.resize(self.size, 0);
                buf
            }
            None => vec![0u8; self.size],
        }
    }

    pub fn release(&self, buf: Vec<u8>) {
        if buf.capacity() >= self.size {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            free.push(buf);
        }
    }

    /// Buffers currently parked in the freelist.
    pub fn idle(&self) -> usize {
        let free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_returns_configured_size() {
        let pool = BufferPool::new(4096);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 4096);
    }

    #[test]
    fn test_release_and_reuse() {
        let pool = BufferPool::new(1024);
        let buf = pool.acquire();
        pool.release(buf);
        assert_eq!(pool.idle(), 1);
        let again = pool.acquire();
        assert_eq!(again.len(), 1024);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_small_buffers_are_dropped() {
        let pool = BufferPool::new(1024);
        pool.release(vec![0u8; 16]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_larger_buffers_are_kept_and_trimmed() {
        let pool = BufferPool::new(1024);
        pool.release(vec![0u8; 8192]);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.acquire().len(), 1024);
    }

    #[test]
    fn test_zero_size_defaults() {
        let pool = BufferPool::new(0);
        assert_eq!(pool.buffer_size(), DEFAULT_BUFFER_SIZE);
        assert_eq!(pool.acquire().len(), DEFAULT_BUFFER_SIZE);
    }
}
