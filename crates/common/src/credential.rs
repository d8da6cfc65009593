// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Guarded secret storage
// Host and proxy secrets live in a locked, fixed-size buffer that is wiped on drop

use std::fmt;

use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// A secret held in memory that is excluded from swap (best effort) and zeroed on drop.
///
/// Each `HostConfig` / `ProxyConfig` owns its own `GuardedSecret`; there is no shared
/// secret store. Plaintext leaves the buffer only through [`GuardedSecret::expose`],
/// whose result is itself wiped when the connection attempt drops it.
pub struct GuardedSecret {
    bytes: Box<[u8]>,
    locked: bool,
}

impl GuardedSecret {
    /// Copy `value` into a new guarded buffer
    pub fn new(value: &str) -> Self {
        Self::from_bytes(value.as_bytes())
    }

    fn from_bytes(value: &[u8]) -> Self {
        // Boxed slice: the allocation never moves or grows after locking
        let bytes: Box<[u8]> = value.to_vec().into_boxed_slice();
        let locked = lock_memory(&bytes);
        if !locked && !bytes.is_empty() {
            debug!("Could not lock secret buffer in memory; continuing unlocked");
        }
        Self { bytes, locked }
    }

    /// Replace the secret; the previous buffer is wiped
    pub fn set(&mut self, value: &str) {
        *self = Self::new(value);
    }

    /// Plaintext copy for the duration of one connection attempt
    pub fn expose(&self) -> Zeroizing<String> {
        Zeroizing::new(String::from_utf8_lossy(&self.bytes).into_owned())
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl From<String> for GuardedSecret {
    fn from(mut value: String) -> Self {
        let secret = Self::new(&value);
        value.zeroize();
        secret
    }
}

impl From<Zeroizing<String>> for GuardedSecret {
    fn from(value: Zeroizing<String>) -> Self {
        Self::new(&value)
    }
}

impl Clone for GuardedSecret {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.bytes)
    }
}

impl fmt::Debug for GuardedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuardedSecret(<redacted>)")
    }
}

impl Drop for GuardedSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
        if self.locked {
            unlock_memory(&self.bytes);
        }
    }
}

#[cfg(unix)]
fn lock_memory(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    // SAFETY: the pointer and length describe a live allocation owned by the caller
    unsafe { libc::mlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) == 0 }
}

#[cfg(unix)]
fn unlock_memory(bytes: &[u8]) {
    // SAFETY: same allocation that was passed to mlock
    unsafe {
        libc::munlock(bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

#[cfg(not(unix))]
fn lock_memory(_bytes: &[u8]) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_memory(_bytes: &[u8]) {}
