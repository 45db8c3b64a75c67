//! The per-file key: lives until `destroy`, which zeroes it immediately
//! rather than waiting on `Drop`. Same `Zeroize` shape, same `Drop` that
//! unlocks and zeroes the backing memory.

use zeroize::Zeroize;

/// A 256-bit symmetric key shared by the reader and writer of one XSP
/// object. Copied defensively into the reader/writer constructor; owned
/// (not referenced) by whoever holds it.
#[derive(Clone)]
pub struct SegKey(pub [u8; 32]);

impl Zeroize for SegKey {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for SegKey {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munlock(self.0.as_ptr() as *const libc::c_void, self.0.len());
        }
        self.zeroize();
    }
}

impl SegKey {
    /// Wrap an existing 32-byte key (e.g. unsealed by the out-of-scope
    /// key-holder) and lock its memory page against swap.
    pub fn new(bytes: [u8; 32]) -> Self {
        let key = Self(bytes);
        key.lock_memory();
        key
    }

    /// Explicitly zero this key now, ahead of `Drop`. Spec §3/§5: "`destroy`
    /// zeroes it".
    pub fn destroy(&mut self) {
        self.zeroize();
    }

    fn lock_memory(&self) {
        #[cfg(unix)]
        unsafe {
            let ret = libc::mlock(self.0.as_ptr() as *const libc::c_void, self.0.len());
            if ret != 0 {
                tracing::warn!("could not lock key memory (mlock failed); key may be swapped to disk");
            }
        }
    }
}

impl std::fmt::Debug for SegKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SegKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_zeroizes_in_place() {
        let mut key = SegKey::new([7u8; 32]);
        key.destroy();
        assert_eq!(key.0, [0u8; 32]);
    }
}
