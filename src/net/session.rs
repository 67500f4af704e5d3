use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound half of a client connection, owned by the transport layer.
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;
    fn write(&self, bytes: &[u8]) -> Result<(), String>;
    fn is_alive(&self) -> bool;
}

/// Buffers every frame in memory. Used by embedders without a transport
/// and by tests that need to inspect delivered frames.
#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    frames: Mutex<Vec<Vec<u8>>>,
    alive: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemorySession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            frames: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn write(&self, bytes: &[u8]) -> Result<(), String> {
        if !self.is_alive() {
            return Err(format!("session {} closed", self.id));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(format!("session {} write failed", self.id));
        }
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
