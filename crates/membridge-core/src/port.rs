//! Memory port: byte-range access to a foreign process
//!
//! The port is the only way the bridge touches the target process. Real
//! implementations talk to an emulator integration (a connector script, a
//! debugger stub, a shared-memory window); this crate ships
//! [`InMemoryPort`], a simulated address space used by the tests and the
//! CLI simulation.
//!
//! ## Contract
//!
//! - `read` / `write` either complete fully or fail with a
//!   [`TransportError`]; there are no partial writes and no internal retries.
//! - All methods take `&mut self`, so a port can never have two operations
//!   in flight at once.
//! - After any error the port reports `is_attached() == false` until
//!   [`MemoryPort::attach`] succeeds again.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TransportError;

/// Read/write access to absolute addresses in a foreign process
pub trait MemoryPort: Send {
    /// Read `len` bytes starting at `address`.
    fn read(
        &mut self,
        address: u32,
        len: u32,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Write `bytes` starting at `address`.
    fn write(
        &mut self,
        address: u32,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Whether the port currently believes it is attached.
    fn is_attached(&self) -> bool;

    /// (Re-)attach to the foreign process.
    fn attach(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A single write observed by the simulated process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// First byte written
    pub address: u32,
    /// Bytes written
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct MappedRange {
    base: u32,
    bytes: Vec<u8>,
}

impl MappedRange {
    fn contains(&self, address: u32, len: u32) -> bool {
        let start = u64::from(address);
        let end = start + u64::from(len);
        start >= u64::from(self.base) && end <= u64::from(self.base) + self.bytes.len() as u64
    }
}

#[derive(Debug)]
enum Fault {
    NextOp(TransportError),
    WriteTo {
        address: u32,
        error: TransportError,
    },
}

#[derive(Debug, Default)]
struct ProcessState {
    ranges: Vec<MappedRange>,
    running: bool,
    faults: Vec<Fault>,
    write_log: Vec<WriteRecord>,
}

impl ProcessState {
    fn range(&self, address: u32, len: u32) -> Result<(usize, usize), TransportError> {
        self.ranges
            .iter()
            .position(|r| r.contains(address, len))
            .map(|i| (i, (address - self.ranges[i].base) as usize))
            .ok_or(TransportError::Unmapped { address, len })
    }

    fn take_fault(&mut self, write_range: Option<(u32, usize)>) -> Option<TransportError> {
        let pos = self.faults.iter().position(|f| match f {
            Fault::NextOp(_) => true,
            Fault::WriteTo { address, .. } => match write_range {
                Some((start, len)) => {
                    u64::from(*address) >= u64::from(start)
                        && u64::from(*address) < u64::from(start) + len as u64
                }
                None => false,
            },
        })?;
        match self.faults.remove(pos) {
            Fault::NextOp(e) | Fault::WriteTo { error: e, .. } => Some(e),
        }
    }

    fn read(&self, address: u32, len: u32) -> Result<Vec<u8>, TransportError> {
        let (idx, offset) = self.range(address, len)?;
        Ok(self.ranges[idx].bytes[offset..offset + len as usize].to_vec())
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), TransportError> {
        let (idx, offset) = self.range(address, bytes.len() as u32)?;
        self.ranges[idx].bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// The "game side" of a simulated process.
///
/// Cloning the handle shares the same address space. Test code and the CLI
/// simulation use it to play the part of the running game: flipping flags,
/// consuming delivered items, crashing the emulator.
#[derive(Debug, Clone, Default)]
pub struct ProcessHandle {
    state: Arc<Mutex<ProcessState>>,
}

impl ProcessHandle {
    /// Create a running process with no mapped memory.
    pub fn new() -> Self {
        let handle = Self::default();
        handle.state.lock().running = true;
        handle
    }

    /// Map `len` zeroed bytes at `base`.
    pub fn map(self, base: u32, len: u32) -> Self {
        self.state.lock().ranges.push(MappedRange {
            base,
            bytes: vec![0; len as usize],
        });
        self
    }

    /// Read memory directly, bypassing faults.
    pub fn peek(&self, address: u32, len: u32) -> Result<Vec<u8>, TransportError> {
        self.state.lock().read(address, len)
    }

    /// Read a single byte directly.
    pub fn peek_byte(&self, address: u32) -> Result<u8, TransportError> {
        Ok(self.peek(address, 1)?[0])
    }

    /// Write memory directly, bypassing faults and the write log.
    pub fn poke(&self, address: u32, bytes: &[u8]) -> Result<(), TransportError> {
        self.state.lock().write(address, bytes)
    }

    /// Whether the simulated process is running.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Simulate the emulator going away.
    pub fn detach(&self) {
        self.state.lock().running = false;
    }

    /// Simulate the emulator coming back (memory is preserved).
    pub fn resume(&self) {
        self.state.lock().running = true;
    }

    /// Fail the next port operation (read or write) with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().faults.push(Fault::NextOp(error));
    }

    /// Fail the next port write that touches `address` with `error`.
    pub fn fail_write_to(&self, address: u32, error: TransportError) {
        self.state
            .lock()
            .faults
            .push(Fault::WriteTo { address, error });
    }

    /// All writes issued through ports so far.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.state.lock().write_log.clone()
    }

    /// Forget recorded writes.
    pub fn clear_write_log(&self) {
        self.state.lock().write_log.clear();
    }
}

/// [`MemoryPort`] over a [`ProcessHandle`]
#[derive(Debug)]
pub struct InMemoryPort {
    process: ProcessHandle,
    attached: bool,
}

impl InMemoryPort {
    /// Create a detached port for `process`; call [`MemoryPort::attach`]
    /// before use.
    pub fn new(process: ProcessHandle) -> Self {
        Self {
            process,
            attached: false,
        }
    }

    /// The process this port talks to.
    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    fn check(&mut self, state: &mut ProcessState, write: Option<(u32, usize)>) -> Result<(), TransportError> {
        if !self.attached {
            return Err(TransportError::Detached);
        }
        if !state.running {
            self.attached = false;
            return Err(TransportError::Detached);
        }
        if let Some(e) = state.take_fault(write) {
            self.attached = false;
            return Err(e);
        }
        Ok(())
    }
}

impl MemoryPort for InMemoryPort {
    async fn read(&mut self, address: u32, len: u32) -> Result<Vec<u8>, TransportError> {
        let state = self.process.state.clone();
        let mut state = state.lock();
        self.check(&mut state, None)?;
        state.read(address, len).inspect_err(|_| self.attached = false)
    }

    async fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), TransportError> {
        let state = self.process.state.clone();
        let mut state = state.lock();
        self.check(&mut state, Some((address, bytes.len())))?;
        state
            .write(address, bytes)
            .inspect_err(|_| self.attached = false)?;
        state.write_log.push(WriteRecord {
            address,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.attached
    }

    async fn attach(&mut self) -> Result<(), TransportError> {
        if self.process.is_running() {
            self.attached = true;
            Ok(())
        } else {
            self.attached = false;
            Err(TransportError::Detached)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process() -> ProcessHandle {
        ProcessHandle::new().map(0x1000, 0x20)
    }

    #[tokio::test]
    async fn test_port_requires_attach() {
        let mut port = InMemoryPort::new(process());
        assert!(!port.is_attached());
        assert_eq!(port.read(0x1000, 1).await, Err(TransportError::Detached));

        port.attach().await.unwrap();
        assert!(port.is_attached());
        assert_eq!(port.read(0x1000, 2).await.unwrap(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let process = process();
        let mut port = InMemoryPort::new(process.clone());
        port.attach().await.unwrap();

        port.write(0x1004, &[1, 2, 3]).await.unwrap();
        assert_eq!(port.read(0x1004, 3).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(process.peek(0x1004, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(
            process.write_log(),
            vec![WriteRecord {
                address: 0x1004,
                bytes: vec![1, 2, 3]
            }]
        );
    }

    #[tokio::test]
    async fn test_unmapped_read_detaches() {
        let mut port = InMemoryPort::new(process());
        port.attach().await.unwrap();

        let err = port.read(0x101F, 2).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Unmapped {
                address: 0x101F,
                len: 2
            }
        );
        assert!(!port.is_attached());
    }

    #[tokio::test]
    async fn test_detached_process_fails_attach() {
        let process = process();
        let mut port = InMemoryPort::new(process.clone());
        port.attach().await.unwrap();

        process.detach();
        assert_eq!(port.read(0x1000, 1).await, Err(TransportError::Detached));
        assert!(port.attach().await.is_err());

        process.resume();
        assert!(port.attach().await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_write_to_is_one_shot() {
        let process = process();
        let mut port = InMemoryPort::new(process.clone());
        port.attach().await.unwrap();

        process.fail_write_to(0x1002, TransportError::Timeout);
        // untouched address is unaffected
        port.write(0x1000, &[1]).await.unwrap();
        assert_eq!(
            port.write(0x1001, &[1, 1]).await,
            Err(TransportError::Timeout)
        );
        assert_eq!(process.peek_byte(0x1002).unwrap(), 0);

        port.attach().await.unwrap();
        port.write(0x1001, &[1, 1]).await.unwrap();
        assert_eq!(process.peek_byte(0x1002).unwrap(), 1);
    }
}
