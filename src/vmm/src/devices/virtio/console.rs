// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single port virtio console: queue 0 carries host input to the guest,
//! queue 1 carries guest output to a host writer.

use crate::devices::{
    irq::{VirtioInterrupt, INTERRUPT_STATUS_USED_RING},
    virtio::{
        queue::{Queue, QueueError},
        types,
        virtio_device::{ActivateError, VirtioDevice},
        VIRTIO_F_VERSION_1,
    },
};
use crate::vstate::memory::GuestMemoryMmap;
use log::{debug, warn};
use std::collections::VecDeque;
use std::io::Write;
use vm_memory::Bytes;

const QUEUE_SIZE: u16 = 64;
const QUEUE_SIZES: &[u16] = &[QUEUE_SIZE, QUEUE_SIZE];

const RECEIVEQ: usize = 0;
const TRANSMITQ: usize = 1;

/// Host input kept while the guest has no receive buffers.
const MAX_PENDING_INPUT: usize = 1 << 16;

// cols (le16), rows (le16), max_nr_ports (le32), emerg_wr (le32). None of
// the features giving them meaning are offered.
const CONFIG_SPACE_SIZE: usize = 12;

struct ActiveState {
    mem: GuestMemoryMmap,
    interrupt: VirtioInterrupt,
    queues: Vec<Queue>,
}

impl ActiveState {
    fn pop(&mut self, index: usize) -> Option<u16> {
        loop {
            match self.queues[index].poll_available(&self.mem) {
                Ok(head) => return head,
                Err(QueueError::InvalidHead(head)) => {
                    warn!("console: skipping invalid descriptor head {}", head);
                }
                Err(e) => {
                    warn!("console: cannot pop queue {}: {}", index, e);
                    return None;
                }
            }
        }
    }

    fn complete(&mut self, index: usize, head: u16, len: u32) -> bool {
        match self.queues[index].complete(&self.mem, head, len) {
            Ok(()) => true,
            Err(e) => {
                warn!("console: cannot complete descriptor {}: {}", head, e);
                false
            }
        }
    }

    fn signal_used_queue(&self) {
        if let Err(e) = self.interrupt.trigger(INTERRUPT_STATUS_USED_RING) {
            warn!("console: cannot signal used queue: {}", e);
        }
    }
}

pub struct Console {
    avail_features: u64,
    acked_features: u64,
    output: Box<dyn Write + Send>,
    pending_input: VecDeque<u8>,
    active: Option<ActiveState>,
}

impl Console {
    pub fn new(output: Box<dyn Write + Send>) -> Self {
        Console {
            avail_features: 1u64 << VIRTIO_F_VERSION_1,
            acked_features: 0,
            output,
            pending_input: VecDeque::new(),
            active: None,
        }
    }

    pub fn pending_input(&self) -> usize {
        self.pending_input.len()
    }

    /// Moves buffered input into the receive buffers the guest posted.
    fn process_rx(&mut self) -> bool {
        let active = match self.active.as_mut() {
            Some(active) => active,
            None => return false,
        };
        let mut used_any = false;
        while !self.pending_input.is_empty() {
            let head = match active.pop(RECEIVEQ) {
                Some(head) => head,
                None => break,
            };
            let mut written = 0u32;
            match active.queues[RECEIVEQ].follow_chain(&active.mem, head) {
                Ok(chain) => {
                    for desc in chain.iter().filter(|d| d.is_write_only()) {
                        let n = std::cmp::min(desc.len() as usize, self.pending_input.len());
                        let bytes: Vec<u8> = self.pending_input.iter().take(n).copied().collect();
                        if let Err(e) = active.mem.write_slice(&bytes, desc.addr()) {
                            warn!("console: cannot write receive buffer: {}", e);
                            break;
                        }
                        self.pending_input.drain(..n);
                        written += n as u32;
                        if self.pending_input.is_empty() {
                            break;
                        }
                    }
                }
                Err(e) => warn!("console: invalid receive chain: {}", e),
            }
            used_any |= active.complete(RECEIVEQ, head, written);
        }
        if used_any {
            active.signal_used_queue();
        }
        used_any
    }

    /// Writes everything the guest transmitted to the host output.
    fn process_tx(&mut self) -> bool {
        let active = match self.active.as_mut() {
            Some(active) => active,
            None => return false,
        };
        let mut used_any = false;
        while let Some(head) = active.pop(TRANSMITQ) {
            match active.queues[TRANSMITQ].follow_chain(&active.mem, head) {
                Ok(chain) => {
                    for desc in chain.iter().filter(|d| !d.is_write_only()) {
                        let mut buf = vec![0u8; desc.len() as usize];
                        if let Err(e) = active.mem.read_slice(&mut buf, desc.addr()) {
                            warn!("console: cannot read transmit buffer: {}", e);
                            break;
                        }
                        if let Err(e) = self.output.write_all(&buf) {
                            warn!("console: cannot write output: {}", e);
                        }
                    }
                }
                Err(e) => warn!("console: invalid transmit chain: {}", e),
            }
            used_any |= active.complete(TRANSMITQ, head, 0);
        }
        if let Err(e) = self.output.flush() {
            debug!("console: cannot flush output: {}", e);
        }
        if used_any {
            active.signal_used_queue();
        }
        used_any
    }
}

impl VirtioDevice for Console {
    fn device_type(&self) -> u32 {
        types::CONSOLE
    }

    fn queue_max_sizes(&self) -> &[u16] {
        QUEUE_SIZES
    }

    fn features(&self, page: u32) -> u32 {
        match page {
            0 => self.avail_features as u32,
            1 => (self.avail_features >> 32) as u32,
            _ => 0,
        }
    }

    fn ack_features(&mut self, page: u32, value: u32) {
        let v = match page {
            0 => u64::from(value),
            1 => u64::from(value) << 32,
            _ => 0,
        };
        self.acked_features |= v & self.avail_features;
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        if offset < CONFIG_SPACE_SIZE as u64 {
            data.fill(0);
        }
    }

    fn activate(
        &mut self,
        mem: GuestMemoryMmap,
        interrupt: VirtioInterrupt,
        queues: Vec<Queue>,
    ) -> Result<(), ActivateError> {
        if self.active.is_some() {
            return Err(ActivateError::AlreadyActivated);
        }
        if queues.len() != QUEUE_SIZES.len() {
            return Err(ActivateError::UnsupportedNumOfVirtioQueue {
                expected: QUEUE_SIZES.len(),
                got: queues.len(),
            });
        }
        self.active = Some(ActiveState {
            mem,
            interrupt,
            queues,
        });
        Ok(())
    }

    fn queue_notify(&mut self, index: u32) {
        match index as usize {
            RECEIVEQ => {
                self.process_rx();
            }
            TRANSMITQ => {
                self.process_tx();
            }
            _ => warn!("console: notification for unknown queue {}", index),
        }
    }

    fn receive_input(&mut self, data: &[u8]) -> bool {
        let room = MAX_PENDING_INPUT.saturating_sub(self.pending_input.len());
        if data.len() > room {
            warn!("console: dropping {} bytes of input", data.len() - room);
        }
        self.pending_input
            .extend(data.iter().take(room).copied());
        self.process_rx();
        true
    }

    fn reset(&mut self) {
        self.active = None;
        self.acked_features = 0;
        self.pending_input.clear();
    }
}
