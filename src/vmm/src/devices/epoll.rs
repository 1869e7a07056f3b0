// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::{debug, info, warn};
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use utils::{
    epoll, errno,
    eventfd::{EventFd, EFD_NONBLOCK},
    signal::{self, Killable},
};

/// Largest chunk of input taken per poll.
const INPUT_CHUNK: usize = 64;
const MAX_EVENTS: usize = 4;

/// Signal that pulls the vcpu thread out of the guest.
fn kick_signal() -> libc::c_int {
    signal::SIGRTMIN()
}

/// Milliseconds between two kicks while input waits for the loop thread.
const KICK_INTERVAL_MS: i32 = 10;

const WATCH_INPUT: u64 = 0;
const WATCH_STOP: u64 = 1;

/// Errors associated with actions on epoll.
#[derive(Debug, thiserror::Error)]
pub enum EpollContextError {
    /// Epoll file descriptor create error.
    #[error("Epoll file descriptor create error: {0}")]
    Create(io::Error),
    #[error("Failed to add a file descriptor to epoll: {0}")]
    Add(io::Error),
    #[error("Failed to wait on epoll: {0}")]
    Wait(io::Error),
    #[error("Failed to read host input: {0}")]
    Read(io::Error),
    #[error("A host input is already registered")]
    InputExists,
    #[error("Failed to install the vcpu kick handler: {0}")]
    KickHandler(errno::Error),
    #[error("Failed to start the input watcher: {0}")]
    Watcher(io::Error),
}

/// Host side byte stream feeding the guest console.
pub trait InputSource: Read + AsRawFd + Send {}

impl<T: Read + AsRawFd + Send> InputSource for T {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpollDispatch {
    Input,
}

/// Readiness of host inputs, checked from the vcpu loop without blocking.
pub struct EpollContext {
    ep: epoll::Epoll,
    dispatch_table: Vec<EpollDispatch>,
    input: Option<Box<dyn InputSource>>,
}

impl EpollContext {
    pub fn new() -> Result<Self, EpollContextError> {
        let ep = epoll::Epoll::new().map_err(EpollContextError::Create)?;
        Ok(EpollContext {
            ep,
            dispatch_table: Vec::with_capacity(2),
            input: None,
        })
    }

    pub fn add_input(&mut self, input: Box<dyn InputSource>) -> Result<(), EpollContextError> {
        if self.input.is_some() {
            return Err(EpollContextError::InputExists);
        }
        self.ep
            .ctl(
                epoll::ControlOperation::Add,
                input.as_raw_fd(),
                epoll::EpollEvent::new(epoll::EventSet::IN, self.dispatch_table.len() as u64),
            )
            .map_err(EpollContextError::Add)?;
        self.dispatch_table.push(EpollDispatch::Input);
        self.input = Some(input);
        Ok(())
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// Starts watching the registered input on behalf of the calling thread.
    pub fn watch_input(&self) -> Result<Option<InputWatcher>, EpollContextError> {
        match self.input.as_ref() {
            Some(input) => InputWatcher::start(input.as_raw_fd()).map(Some),
            None => Ok(None),
        }
    }

    fn remove_input(&mut self) {
        if let Some(input) = self.input.take() {
            if let Err(e) = self.ep.ctl(
                epoll::ControlOperation::Delete,
                input.as_raw_fd(),
                epoll::EpollEvent::default(),
            ) {
                debug!("failed to remove host input from epoll: {}", e);
            }
        }
    }

    /// Bytes the host input has ready right now, possibly none. The input is
    /// dropped once it reaches end of file.
    pub fn poll_input(&mut self) -> Result<Vec<u8>, EpollContextError> {
        let mut events = [epoll::EpollEvent::default(); MAX_EVENTS];
        let count = match self.ep.wait(0, &mut events) {
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(EpollContextError::Wait(e)),
        };

        let mut data = Vec::new();
        for event in &events[..count] {
            match self.dispatch_table.get(event.data() as usize).copied() {
                Some(EpollDispatch::Input) => {
                    let input = match self.input.as_mut() {
                        Some(input) => input,
                        None => continue,
                    };
                    let mut buf = [0u8; INPUT_CHUNK];
                    match input.read(&mut buf) {
                        Ok(0) => {
                            info!("host input closed");
                            self.remove_input();
                        }
                        Ok(n) => data.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => (),
                        Err(e) => return Err(EpollContextError::Read(e)),
                    }
                }
                None => debug!("epoll event with unknown token {}", event.data()),
            }
        }
        Ok(data)
    }
}

extern "C" fn handle_kick(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    // Nothing to do: the blocked KVM_RUN returns with EINTR.
}

fn install_kick_handler() -> Result<(), EpollContextError> {
    static INSTALLED: OnceLock<Result<(), errno::Error>> = OnceLock::new();
    INSTALLED
        .get_or_init(|| signal::register_signal_handler(kick_signal(), handle_kick))
        .clone()
        .map_err(EpollContextError::KickHandler)
}

struct KickTarget(libc::pthread_t);

// SAFETY: the target is the thread running the vcpu loop, which joins the
// watcher before it returns.
unsafe impl Killable for KickTarget {
    fn pthread_handle(&self) -> libc::pthread_t {
        self.0
    }
}

/// Waits on host input from a helper thread and kicks the vcpu thread out of
/// the guest once input is readable.
///
/// The watcher never reads the input or touches a device. The vcpu loop
/// drains the input itself after [`InputWatcher::pending`] was raised, which
/// lowers it again. Kicks repeat while it stays raised, so a signal landing
/// just before the vcpu enters the guest is never lost for good.
pub struct InputWatcher {
    stop: EventFd,
    pending: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InputWatcher {
    fn start(input: RawFd) -> Result<Self, EpollContextError> {
        install_kick_handler()?;
        // SAFETY: pthread_self has no preconditions.
        let target = KickTarget(unsafe { libc::pthread_self() });

        let stop = EventFd::new(EFD_NONBLOCK).map_err(EpollContextError::Watcher)?;
        let ready = epoll::Epoll::new().map_err(EpollContextError::Watcher)?;
        let idle = epoll::Epoll::new().map_err(EpollContextError::Watcher)?;
        let add = |ep: &epoll::Epoll, fd: RawFd, token: u64| {
            ep.ctl(
                epoll::ControlOperation::Add,
                fd,
                epoll::EpollEvent::new(epoll::EventSet::IN, token),
            )
            .map_err(EpollContextError::Watcher)
        };
        add(&ready, input, WATCH_INPUT)?;
        add(&ready, stop.as_raw_fd(), WATCH_STOP)?;
        add(&idle, stop.as_raw_fd(), WATCH_STOP)?;

        let pending = Arc::new(AtomicBool::new(false));
        let flag = pending.clone();
        let thread = thread::Builder::new()
            .name(String::from("input-watcher"))
            .spawn(move || watch(ready, idle, flag, target))
            .map_err(EpollContextError::Watcher)?;
        Ok(InputWatcher {
            stop,
            pending,
            thread: Some(thread),
        })
    }

    /// Raised while input is readable and the vcpu loop has not taken it.
    pub fn pending(&self) -> &AtomicBool {
        &self.pending
    }
}

impl Drop for InputWatcher {
    fn drop(&mut self) {
        if let Err(e) = self.stop.write(1) {
            warn!("cannot stop the input watcher: {}", e);
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("input watcher panicked");
            }
        }
    }
}

fn watch(ready: epoll::Epoll, idle: epoll::Epoll, pending: Arc<AtomicBool>, target: KickTarget) {
    let mut events = [epoll::EpollEvent::default(); 2];
    loop {
        let count = match ready.wait(-1, &mut events) {
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("input watcher stopped: {}", e);
                return;
            }
        };
        if events[..count].iter().any(|e| e.data() == WATCH_STOP) {
            return;
        }
        if count == 0 {
            continue;
        }

        pending.store(true, Ordering::SeqCst);
        while pending.load(Ordering::SeqCst) {
            if let Err(e) = target.kill(kick_signal()) {
                warn!("cannot kick the vcpu thread: {}", e);
                return;
            }
            match idle.wait(KICK_INTERVAL_MS, &mut events) {
                Ok(0) => (),
                Ok(_) => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => {
                    warn!("input watcher stopped: {}", e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    pub fn test_epoll_context_new() {
        let ctx = EpollContext::new().unwrap();
        assert!(ctx.dispatch_table.is_empty());
        assert!(!ctx.has_input());
    }

    #[test]
    pub fn test_poll_without_input() {
        let mut ctx = EpollContext::new().unwrap();
        assert!(ctx.poll_input().unwrap().is_empty());
    }

    #[test]
    pub fn test_poll_input() {
        let (mut host, guest_side) = UnixStream::pair().unwrap();
        let mut ctx = EpollContext::new().unwrap();
        ctx.add_input(Box::new(guest_side)).unwrap();
        assert_eq!(ctx.dispatch_table, vec![EpollDispatch::Input]);
        match ctx.add_input(Box::new(UnixStream::pair().unwrap().0)) {
            Err(EpollContextError::InputExists) => (),
            _ => unreachable!(),
        }

        assert!(ctx.poll_input().unwrap().is_empty());
        host.write_all(b"ls\n").unwrap();
        assert_eq!(ctx.poll_input().unwrap(), b"ls\n");
        assert!(ctx.poll_input().unwrap().is_empty());

        // Larger writes come out in chunks.
        host.write_all(&[b'a'; INPUT_CHUNK + 8]).unwrap();
        assert_eq!(ctx.poll_input().unwrap().len(), INPUT_CHUNK);
        assert_eq!(ctx.poll_input().unwrap().len(), 8);
    }

    #[test]
    pub fn test_watch_input() {
        let mut ctx = EpollContext::new().unwrap();
        assert!(ctx.watch_input().unwrap().is_none());

        let (mut host, guest_side) = UnixStream::pair().unwrap();
        ctx.add_input(Box::new(guest_side)).unwrap();
        let watcher = ctx.watch_input().unwrap().unwrap();
        assert!(!watcher.pending().load(Ordering::SeqCst));

        // The kicks land on this thread and are absorbed by the handler.
        host.write_all(b"q").unwrap();
        let mut waited = 0;
        while !watcher.pending().load(Ordering::SeqCst) {
            assert!(waited < 1000, "input never reported");
            thread::sleep(std::time::Duration::from_millis(1));
            waited += 1;
        }

        // Taking the input quiets the watcher. A kick may cut a poll short.
        let mut data = Vec::new();
        for _ in 0..100 {
            data = ctx.poll_input().unwrap();
            if !data.is_empty() {
                break;
            }
        }
        assert_eq!(data, b"q");
        watcher.pending().store(false, Ordering::SeqCst);
        thread::sleep(std::time::Duration::from_millis(3 * KICK_INTERVAL_MS as u64));
        assert!(!watcher.pending().load(Ordering::SeqCst));
        drop(watcher);
    }

    #[test]
    pub fn test_input_closed() {
        let (host, guest_side) = UnixStream::pair().unwrap();
        let mut ctx = EpollContext::new().unwrap();
        ctx.add_input(Box::new(guest_side)).unwrap();
        drop(host);
        assert!(ctx.poll_input().unwrap().is_empty());
        assert!(!ctx.has_input());
        assert!(ctx.poll_input().unwrap().is_empty());
    }
}
