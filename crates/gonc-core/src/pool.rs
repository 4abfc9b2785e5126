//! Process-wide pool of reusable byte buffers for network I/O, keeping the
//! hot copy paths free of per-transfer allocation.

use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Standard buffer size for network I/O (32 KiB).
pub const BUF_SIZE: usize = 32 * 1024;

/// Upper bound on idle buffers kept around.
const MAX_POOLED: usize = 64;

static POOL: Lazy<Mutex<Vec<Vec<u8>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// A pooled buffer that returns itself to the pool on drop.
pub struct Buffer(Vec<u8>);

impl std::ops::Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl std::ops::DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.0);
        if buf.len() != BUF_SIZE {
            return;
        }
        let mut pool = POOL.lock().expect("buffer pool poisoned");
        if pool.len() < MAX_POOLED {
            pool.push(buf);
        }
    }
}

/// Take a 32 KiB buffer from the pool, allocating when it is empty.
pub fn buffer() -> Buffer {
    let buf = {
        let mut pool = POOL.lock().expect("buffer pool poisoned");
        pool.pop()
    };
    Buffer(buf.unwrap_or_else(|| vec![0u8; BUF_SIZE]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_keep_their_size_across_reuse() {
        let mut first = buffer();
        first[0] = 0xFF;
        drop(first);
        let second = buffer();
        assert_eq!(second.len(), BUF_SIZE);
    }

    #[test]
    fn buffer_has_standard_size() {
        assert_eq!(buffer().len(), 32 * 1024);
    }
}
