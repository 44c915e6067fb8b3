//! Link layer access to a CI slot.
//!
//! A [`SlotLink`] moves whole LPDUs between the host and one module slot.
//! The transport layer above it handles fragmentation, polling and timeouts.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use ci_protocol::DEFAULT_LINK_BUFFER_SIZE;

/// Physical state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CamState {
    /// No module inserted.
    Absent,
    /// Module inserted but still initialising.
    Present,
    /// Module ready to exchange LPDUs.
    Ready,
}

/// A byte pipe to one CI slot.
pub trait SlotLink: Send {
    /// Current physical state of the slot.
    fn cam_state(&mut self) -> io::Result<CamState>;

    /// Reset the module.
    fn reset(&mut self) -> io::Result<()>;

    /// Block until an LPDU can be read or `timeout` expires.
    ///
    /// Returns `true` when data is ready.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Read one LPDU without blocking, `None` when nothing is pending.
    fn read_lpdu(&mut self) -> io::Result<Option<Bytes>>;

    /// Write one LPDU.
    fn write_lpdu(&mut self, lpdu: &[u8]) -> io::Result<()>;

    /// Negotiated link buffer size.
    fn buffer_size(&self) -> usize {
        DEFAULT_LINK_BUFFER_SIZE
    }
}

#[cfg(unix)]
pub use device::DeviceLink;

#[cfg(unix)]
mod device {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use bytes::Bytes;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    use super::{CamState, SlotLink};

    /// One slot of a CA character device. Every read and write carries a
    /// single LPDU prefixed with the slot number; frames for other slots of
    /// the same device are skipped.
    ///
    /// Module presence is inferred from the device: a failed open or a
    /// `ENODEV` read means the module is gone.
    pub struct DeviceLink {
        path: PathBuf,
        slot: u8,
        file: Option<File>,
        buffer_size: usize,
    }

    impl DeviceLink {
        pub fn open(path: impl AsRef<Path>, slot: u8, buffer_size: usize) -> io::Result<Self> {
            let mut link = Self {
                path: path.as_ref().to_path_buf(),
                slot,
                file: None,
                buffer_size,
            };
            link.reopen()?;
            Ok(link)
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn slot(&self) -> u8 {
            self.slot
        }

        fn reopen(&mut self) -> io::Result<()> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(&self.path)?;
            self.file = Some(file);
            Ok(())
        }

        fn file(&mut self) -> io::Result<&mut File> {
            self.file
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "slot device closed"))
        }
    }

    impl SlotLink for DeviceLink {
        fn cam_state(&mut self) -> io::Result<CamState> {
            if self.file.is_none() && self.reopen().is_err() {
                return Ok(CamState::Absent);
            }
            Ok(CamState::Ready)
        }

        fn reset(&mut self) -> io::Result<()> {
            self.file = None;
            self.reopen()
        }

        fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
            let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
            let file = self.file()?;
            let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN | PollFlags::POLLPRI)];
            let ready = poll(&mut fds, PollTimeout::from(ms)).map_err(io::Error::from)?;
            Ok(ready > 0)
        }

        fn read_lpdu(&mut self) -> io::Result<Option<Bytes>> {
            let mut buf = vec![0u8; self.buffer_size + 1];
            loop {
                let result = self.file()?.read(&mut buf);
                match result {
                    Ok(0) => return Ok(None),
                    Ok(n) => match strip_slot(self.slot, &buf[..n]) {
                        Some(lpdu) => return Ok(Some(Bytes::copy_from_slice(lpdu))),
                        None => continue,
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => {
                        if e.raw_os_error() == Some(nix::libc::ENODEV) {
                            self.file = None;
                        }
                        return Err(e);
                    }
                }
            }
        }

        fn write_lpdu(&mut self, lpdu: &[u8]) -> io::Result<()> {
            let frame = frame_for_slot(self.slot, lpdu);
            self.file()?.write_all(&frame)
        }

        fn buffer_size(&self) -> usize {
            self.buffer_size
        }
    }

    fn frame_for_slot(slot: u8, lpdu: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(lpdu.len() + 1);
        frame.push(slot);
        frame.extend_from_slice(lpdu);
        frame
    }

    /// The LPDU of a frame read from the device, if it belongs to `slot`.
    fn strip_slot(slot: u8, frame: &[u8]) -> Option<&[u8]> {
        match frame.split_first() {
            Some((&s, lpdu)) if s == slot && !lpdu.is_empty() => Some(lpdu),
            _ => None,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_frames_carry_slot_number() {
            assert_eq!(frame_for_slot(1, &[0x01, 0x00, 0x82]), vec![1, 0x01, 0x00, 0x82]);
        }

        #[test]
        fn test_frames_for_other_slots_skipped() {
            assert_eq!(strip_slot(1, &[1, 0x01, 0x00]), Some(&[0x01, 0x00][..]));
            assert_eq!(strip_slot(0, &[1, 0x01, 0x00]), None);
            assert_eq!(strip_slot(1, &[1]), None);
            assert_eq!(strip_slot(1, &[]), None);
        }

        #[test]
        fn test_open_missing_device_fails() {
            assert!(DeviceLink::open("/nonexistent/dvb/ca0", 0, 255).is_err());
        }
    }
}

#[cfg(test)]
pub use loopback::LoopbackLink;

#[cfg(test)]
mod loopback {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use ci_protocol::{fragment_lpdu, LinkReassembler};

    use super::{CamState, SlotLink};

    type Responder = Box<dyn FnMut(u8, &[u8]) -> Vec<Bytes> + Send>;

    struct Inner {
        state: CamState,
        incoming: VecDeque<Bytes>,
        written: Vec<Bytes>,
        resets: usize,
        fail_writes: bool,
    }

    /// In-memory link. Host TPDUs are reassembled and handed to a responder
    /// playing the module; its replies are fragmented back into LPDUs.
    pub struct LoopbackLink {
        inner: Arc<Mutex<Inner>>,
        reassembler: LinkReassembler,
        responder: Responder,
        buffer_size: usize,
    }

    /// Test-side view of a [`LoopbackLink`].
    #[derive(Clone)]
    pub struct LoopbackControl {
        inner: Arc<Mutex<Inner>>,
    }

    impl LoopbackLink {
        pub fn new<F>(buffer_size: usize, responder: F) -> (Self, LoopbackControl)
        where
            F: FnMut(u8, &[u8]) -> Vec<Bytes> + Send + 'static,
        {
            let inner = Arc::new(Mutex::new(Inner {
                state: CamState::Ready,
                incoming: VecDeque::new(),
                written: Vec::new(),
                resets: 0,
                fail_writes: false,
            }));
            let link = Self {
                inner: inner.clone(),
                reassembler: LinkReassembler::new(0x10000),
                responder: Box::new(responder),
                buffer_size,
            };
            (link, LoopbackControl { inner })
        }
    }

    impl LoopbackControl {
        pub fn set_state(&self, state: CamState) {
            self.inner.lock().unwrap().state = state;
        }

        /// Raw LPDUs the host wrote so far.
        pub fn written(&self) -> Vec<Bytes> {
            self.inner.lock().unwrap().written.clone()
        }

        /// Make every following write fail with `BrokenPipe`.
        pub fn set_fail_writes(&self, fail: bool) {
            self.inner.lock().unwrap().fail_writes = fail;
        }

        pub fn resets(&self) -> usize {
            self.inner.lock().unwrap().resets
        }
    }

    impl SlotLink for LoopbackLink {
        fn cam_state(&mut self) -> io::Result<CamState> {
            Ok(self.inner.lock().unwrap().state)
        }

        fn reset(&mut self) -> io::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.incoming.clear();
            inner.resets += 1;
            self.reassembler.clear();
            Ok(())
        }

        fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(!self.inner.lock().unwrap().incoming.is_empty())
        }

        fn read_lpdu(&mut self) -> io::Result<Option<Bytes>> {
            Ok(self.inner.lock().unwrap().incoming.pop_front())
        }

        fn write_lpdu(&mut self, lpdu: &[u8]) -> io::Result<()> {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.fail_writes {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link write failed"));
                }
                inner.written.push(Bytes::copy_from_slice(lpdu));
            }
            let complete = self
                .reassembler
                .push(lpdu)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if let Some((tcid, tpdu)) = complete {
                let replies = (self.responder)(tcid, &tpdu);
                let mut inner = self.inner.lock().unwrap();
                for reply in replies {
                    inner
                        .incoming
                        .extend(fragment_lpdu(tcid, &reply, self.buffer_size));
                }
            }
            Ok(())
        }

        fn buffer_size(&self) -> usize {
            self.buffer_size
        }
    }
}

#[cfg(test)]
pub use loopback::LoopbackControl;
