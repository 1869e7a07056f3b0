// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::devices::{
    irq::{VirtioInterrupt, INTERRUPT_STATUS_USED_RING},
    virtio::{
        queue::{Queue, QueueError, VirtqDesc},
        types,
        virtio_device::{ActivateError, VirtioDevice},
        VIRTIO_F_VERSION_1,
    },
};
use crate::vstate::memory::GuestMemoryMmap;
use log::{debug, warn};
use std::{
    fs::File,
    io::{Seek, SeekFrom},
    os::linux::fs::MetadataExt,
};
use vm_memory::{Bytes, GuestAddress, GuestMemoryError};

const SECTOR_SHIFT: u8 = 9; // 512 = 2^9
const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

const QUEUE_SIZE: u16 = 256;
const QUEUE_SIZES: &[u16] = &[QUEUE_SIZE];

const VIRTIO_BLK_F_RO: u32 = 5;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

const VIRTIO_BLK_ID_BYTES: usize = 20;

// type (le32), reserved (le32), sector (le64)
const REQUEST_HEADER_SIZE: u32 = 16;

/// Errors associated with creating a block device.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// Failed to seek backend (host-side) disk file.
    #[error("Failed to get the size of the disk file: {0}")]
    Seek(#[source] std::io::Error),
    /// Getting a block's metadata failes.
    #[error("Failed to get the metadata of the disk file: {0}")]
    GetFileMetadata(#[source] std::io::Error),
}

/// BlockRequestType represents the request type of virtio-blk.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum BlockRequestType {
    In,
    Out,
    Flush,
    GetDeviceID,
    Unsupported(u32),
}

impl From<u32> for BlockRequestType {
    fn from(value: u32) -> Self {
        match value {
            VIRTIO_BLK_T_IN => BlockRequestType::In,
            VIRTIO_BLK_T_OUT => BlockRequestType::Out,
            VIRTIO_BLK_T_FLUSH => BlockRequestType::Flush,
            VIRTIO_BLK_T_GET_ID => BlockRequestType::GetDeviceID,
            t => BlockRequestType::Unsupported(t),
        }
    }
}

/// Errors associated with parsing a virtio-blk request.
#[derive(Debug, thiserror::Error)]
enum BlockRequestParseError {
    /// The descriptor chain itself is broken.
    #[error("Invalid descriptor chain: {0}")]
    Queue(#[from] QueueError),
    /// Guest gave us bad memory address.
    #[error("Guest gave us bad memory address: {0}")]
    BadMemoryAddressError(#[from] GuestMemoryError),
    /// Guest gave us a write only descriptor that protocol says to read from.
    #[error("Guest gave us a write only descriptor that protocol says to read from")]
    UnexpectedWriteOnlyDescriptor,
    /// Guest gave us a read only descriptor that protocol says to write to.
    #[error("Guest gave us a read only descriptor that protocol says to write to")]
    UnexpectedReadOnlyDescriptor,
    /// Guest gave us too few desciptor in a descriptor chain.
    #[error("Guest gave us too few desciptor in a descriptor chain")]
    DescriptorChainTooShort,
    /// Guest gave us a descriptor that was too short to use.
    #[error("Guest gave us a descriptor that was too short to use")]
    DescriptorLengthTooSmall,
}

/// Errors associated with actions on backend (host-side) disk file.
#[derive(Debug, thiserror::Error)]
enum BlockExecuteError {
    /// Failed to flush backend (host-side) disk file.
    #[error("Failed to flush backend (host-side) disk file: {0}")]
    Flush(#[source] std::io::Error),
    /// Failed to read from backend (host-side) disk file.
    #[error("Failed to read from backend (host-side) disk file: {0}")]
    Read(#[source] GuestMemoryError),
    /// Failed to seek backend (host-side) disk file.
    #[error("Failed to seek backend (host-side) disk file: {0}")]
    Seek(#[source] std::io::Error),
    /// Failed to write to backend (host-side) disk file.
    #[error("Failed to write to backend (host-side) disk file: {0}")]
    Write(#[source] GuestMemoryError),
    /// The request touches sectors past the end of the disk.
    #[error("Request at sector {0} goes past the end of the disk")]
    OutOfRange(u64),
    /// Write request on a read-only disk.
    #[error("Write request on a read-only disk")]
    ReadOnly,
    /// The data buffers are too long to be reported in a used element.
    #[error("Request of {0} bytes is too large")]
    TooLarge(u64),
    /// Unsupported request is occcured.
    #[error("Unsupported request has occcured. Request type is {0}.")]
    Unsupported(u32),
}

impl BlockExecuteError {
    fn status(&self) -> u8 {
        match self {
            BlockExecuteError::Unsupported(_) => VIRTIO_BLK_S_UNSUPP,
            _ => VIRTIO_BLK_S_IOERR,
        }
    }
}

/// Host file backing the guest disk.
struct DiskProperties {
    file: File,
    nsectors: u64,
    read_only: bool,
    image_id: Vec<u8>,
}

impl DiskProperties {
    fn new(mut file: File, read_only: bool) -> Result<Self, BlockError> {
        let disk_size = file.seek(SeekFrom::End(0)).map_err(BlockError::Seek)?;
        if disk_size % SECTOR_SIZE != 0 {
            warn!(
                "Disk size {} is not a multiple of sector size {}; \
                     the remainder will not be visible to the guest.",
                disk_size, SECTOR_SIZE
            );
        }
        let image_id = Self::build_device_id(&file)?;
        Ok(DiskProperties {
            file,
            nsectors: disk_size >> SECTOR_SHIFT,
            read_only,
            image_id,
        })
    }

    fn build_device_id(disk_image: &File) -> Result<Vec<u8>, BlockError> {
        let blk_metadata = disk_image.metadata().map_err(BlockError::GetFileMetadata)?;
        let id = format!(
            "{}{}{}",
            blk_metadata.st_dev(),
            blk_metadata.st_rdev(),
            blk_metadata.st_ino(),
        );
        let mut buf = vec![0; VIRTIO_BLK_ID_BYTES];
        let bytes_to_copy = std::cmp::min(id.len(), VIRTIO_BLK_ID_BYTES);
        buf[..bytes_to_copy].copy_from_slice(&id.as_bytes()[..bytes_to_copy]);
        Ok(buf)
    }

    fn config_space(&self) -> Vec<u8> {
        // Only the capacity in sectors is exposed. The config space is little endian.
        self.nsectors.to_le_bytes().to_vec()
    }
}

struct Request {
    request_type: BlockRequestType,
    sector: u64,
    data: Vec<(GuestAddress, u32)>,
    status_addr: GuestAddress,
}

impl Request {
    /// Header first, data buffers, one writable status byte last.
    fn parse(chain: &[VirtqDesc], mem: &GuestMemoryMmap) -> Result<Request, BlockRequestParseError> {
        let (header, rest) = chain
            .split_first()
            .ok_or(BlockRequestParseError::DescriptorChainTooShort)?;
        let (status, data) = rest
            .split_last()
            .ok_or(BlockRequestParseError::DescriptorChainTooShort)?;

        // The head contains the request type which MUST be readable
        if header.is_write_only() {
            return Err(BlockRequestParseError::UnexpectedWriteOnlyDescriptor);
        }
        if header.len() < REQUEST_HEADER_SIZE {
            return Err(BlockRequestParseError::DescriptorLengthTooSmall);
        }
        let request_type = BlockRequestType::from(u32::from_le(mem.read_obj(header.addr())?));
        let sector = u64::from_le(mem.read_obj(GuestAddress(header.addr().0 + 8))?);

        for desc in data {
            match request_type {
                BlockRequestType::Out if desc.is_write_only() => {
                    return Err(BlockRequestParseError::UnexpectedWriteOnlyDescriptor)
                }
                BlockRequestType::In | BlockRequestType::GetDeviceID
                    if !desc.is_write_only() =>
                {
                    return Err(BlockRequestParseError::UnexpectedReadOnlyDescriptor)
                }
                _ => (),
            }
        }

        // The status MUST always be writable
        if !status.is_write_only() {
            return Err(BlockRequestParseError::UnexpectedReadOnlyDescriptor);
        }
        if status.is_empty() {
            return Err(BlockRequestParseError::DescriptorLengthTooSmall);
        }

        Ok(Request {
            request_type,
            sector,
            data: data.iter().map(|d| (d.addr(), d.len())).collect(),
            status_addr: status.addr(),
        })
    }

    fn data_len(&self) -> u64 {
        self.data.iter().map(|(_, len)| u64::from(*len)).sum()
    }

    /// Runs the request and returns the number of bytes written to guest
    /// buffers, status excluded.
    fn execute(
        &self,
        disk: &mut DiskProperties,
        mem: &GuestMemoryMmap,
    ) -> Result<u32, BlockExecuteError> {
        let check_range = || {
            let end_sector = self
                .sector
                .checked_add((self.data_len() + SECTOR_SIZE - 1) >> SECTOR_SHIFT);
            match end_sector {
                Some(end) if end <= disk.nsectors => Ok(()),
                _ => Err(BlockExecuteError::OutOfRange(self.sector)),
            }
        };

        match self.request_type {
            BlockRequestType::In => {
                // The used length also counts the status byte.
                let len = u32::try_from(self.data_len())
                    .ok()
                    .filter(|len| *len < u32::MAX)
                    .ok_or(BlockExecuteError::TooLarge(self.data_len()))?;
                check_range()?;
                disk.file
                    .seek(SeekFrom::Start(self.sector << SECTOR_SHIFT))
                    .map_err(BlockExecuteError::Seek)?;
                for (addr, len) in &self.data {
                    mem.read_exact_from(*addr, &mut disk.file, *len as usize)
                        .map_err(BlockExecuteError::Read)?;
                }
                Ok(len)
            }
            BlockRequestType::Out => {
                if disk.read_only {
                    return Err(BlockExecuteError::ReadOnly);
                }
                check_range()?;
                disk.file
                    .seek(SeekFrom::Start(self.sector << SECTOR_SHIFT))
                    .map_err(BlockExecuteError::Seek)?;
                for (addr, len) in &self.data {
                    mem.write_all_to(*addr, &mut disk.file, *len as usize)
                        .map_err(BlockExecuteError::Write)?;
                }
                Ok(0)
            }
            BlockRequestType::Flush => {
                disk.file.sync_all().map_err(BlockExecuteError::Flush)?;
                Ok(0)
            }
            BlockRequestType::GetDeviceID => {
                let (addr, len) = match self.data.first() {
                    Some(buf) => *buf,
                    None => return Ok(0),
                };
                let n = std::cmp::min(len as usize, disk.image_id.len());
                mem.write_slice(&disk.image_id[..n], addr)
                    .map_err(BlockExecuteError::Write)?;
                Ok(n as u32)
            }
            BlockRequestType::Unsupported(t) => Err(BlockExecuteError::Unsupported(t)),
        }
    }
}

/// Resources handed over by the transport on activation.
struct ActiveState {
    mem: GuestMemoryMmap,
    interrupt: VirtioInterrupt,
    queue: Queue,
}

/// Virtio device for exposing block level read/write operations on a host file.
///
/// Requests are served synchronously when the driver notifies the queue.
pub struct Block {
    disk: DiskProperties,
    avail_features: u64,
    acked_features: u64,
    config_space: Vec<u8>,
    active: Option<ActiveState>,
}

impl Block {
    /// Create a new virtio block device that operates on the given file
    /// The given file must be seekable and sizable
    pub fn new(disk_image: File, read_only: bool) -> Result<Block, BlockError> {
        let disk = DiskProperties::new(disk_image, read_only)?;
        let mut avail_features = 1u64 << VIRTIO_F_VERSION_1;
        if read_only {
            avail_features |= 1u64 << VIRTIO_BLK_F_RO;
        }
        Ok(Block {
            config_space: disk.config_space(),
            disk,
            avail_features,
            acked_features: 0u64,
            active: None,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.disk.read_only
    }

    /// Capacity in sectors.
    pub fn nsectors(&self) -> u64 {
        self.disk.nsectors
    }

    /// Serves every available request. Returns true if any was completed.
    fn process_queue(&mut self) -> bool {
        let active = match self.active.as_mut() {
            Some(active) => active,
            None => return false,
        };
        let mut used_any = false;
        loop {
            let head = match active.queue.poll_available(&active.mem) {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(QueueError::InvalidHead(head)) => {
                    warn!("block: skipping invalid descriptor head {}", head);
                    continue;
                }
                Err(e) => {
                    warn!("block: cannot pop the available ring: {}", e);
                    break;
                }
            };

            let parsed = active
                .queue
                .follow_chain(&active.mem, head)
                .map_err(BlockRequestParseError::from)
                .and_then(|chain| Request::parse(&chain, &active.mem));
            let len = match parsed {
                Ok(request) => {
                    let (status, len) = match request.execute(&mut self.disk, &active.mem) {
                        Ok(len) => (VIRTIO_BLK_S_OK, len),
                        Err(e) => {
                            warn!("failed executing disk request: {}", e);
                            (e.status(), 0)
                        }
                    };
                    match active.mem.write_obj(status, request.status_addr) {
                        Ok(()) => len + 1,
                        Err(e) => {
                            warn!("block: cannot write request status: {}", e);
                            0
                        }
                    }
                }
                Err(e) => {
                    warn!("failed processing available desciptor chain: {}", e);
                    0
                }
            };

            if let Err(e) = active.queue.complete(&active.mem, head, len) {
                warn!("block: cannot complete descriptor {}: {}", head, e);
                break;
            }
            used_any = true;
        }

        if used_any {
            if let Err(e) = active.interrupt.trigger(INTERRUPT_STATUS_USED_RING) {
                warn!("block: cannot signal used queue: {}", e);
            }
        }
        used_any
    }
}

impl VirtioDevice for Block {
    fn device_type(&self) -> u32 {
        types::BLOCK_DEVICE
    }

    fn queue_max_sizes(&self) -> &[u16] {
        QUEUE_SIZES
    }

    fn features(&self, page: u32) -> u32 {
        match page {
            0 => self.avail_features as u32,
            1 => (self.avail_features >> 32) as u32,
            _ => {
                debug!("block: virtio-block got request for features page: {}", page);
                0u32
            }
        }
    }

    fn ack_features(&mut self, page: u32, value: u32) {
        let mut v = match page {
            0 => u64::from(value),
            1 => u64::from(value) << 32,
            _ => {
                warn!(
                    "block: virtio-block device cannot ack unknown feature page: {}",
                    page
                );
                0u64
            }
        };

        let unrequested_features = v & !self.avail_features;
        if unrequested_features != 0 {
            warn!("block: virtio-block got unknown feature ack: {:x}", v);
            v &= !unrequested_features;
        }
        self.acked_features |= v;
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let config_len = self.config_space.len() as u64;
        if offset >= config_len {
            return;
        }
        let end = std::cmp::min(offset.saturating_add(data.len() as u64), config_len);
        let src = &self.config_space[offset as usize..end as usize];
        data[..src.len()].copy_from_slice(src);
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        warn!(
            "block: ignoring write of {} bytes to read-only config space at 0x{:x}",
            data.len(),
            offset
        );
    }

    fn activate(
        &mut self,
        mem: GuestMemoryMmap,
        interrupt: VirtioInterrupt,
        mut queues: Vec<Queue>,
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
            queue: queues.remove(0),
        });
        Ok(())
    }

    fn queue_notify(&mut self, index: u32) {
        if index != 0 {
            warn!("block: notification for unknown queue {}", index);
            return;
        }
        self.process_queue();
    }

    fn reset(&mut self) {
        self.active = None;
        self.acked_features = 0;
    }
}
