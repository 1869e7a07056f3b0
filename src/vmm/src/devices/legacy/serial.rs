// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::devices::irq::IrqLine;
use crate::devices::registry::MmioDevice;
use log::warn;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use vm_superio::{serial::SerialEvents, Serial};

/// Number of 8 bit registers of the UART.
const SERIAL_REGISTERS: u64 = 8;

/// Host output shared between the UART and its replacement after a reset.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        SharedWriter(Arc::new(Mutex::new(out)))
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

pub struct SerialEventsWrapper;

impl SerialEvents for SerialEventsWrapper {
    fn buffer_read(&self) {}

    fn out_byte(&self) {}

    fn tx_lost_byte(&self) {
        warn!("serial: lost a transmitted byte");
    }

    fn in_buffer_empty(&self) {}
}

/// 16550A UART on MMIO, with byte wide registers.
pub struct SerialDevice {
    serial: Serial<IrqLine, SerialEventsWrapper, SharedWriter>,
    interrupt: IrqLine,
    out: SharedWriter,
}

impl SerialDevice {
    pub fn new(interrupt: IrqLine, out: SharedWriter) -> Self {
        SerialDevice {
            serial: Serial::with_events(interrupt.clone(), SerialEventsWrapper, out.clone()),
            interrupt,
            out,
        }
    }
}

impl MmioDevice for SerialDevice {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        data.fill(0);
        if data.len() != 1 || offset >= SERIAL_REGISTERS {
            warn!("serial: invalid read at 0x{:x}:{}", offset, data.len());
            return;
        }
        data[0] = self.serial.read(offset as u8);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if data.len() != 1 || offset >= SERIAL_REGISTERS {
            warn!("serial: invalid write at 0x{:x}:{}", offset, data.len());
            return;
        }
        if let Err(e) = self.serial.write(offset as u8, data[0]) {
            warn!("serial writing error: {:?}", e);
        }
    }

    fn reset(&mut self) {
        self.serial = Serial::with_events(
            self.interrupt.clone(),
            SerialEventsWrapper,
            self.out.clone(),
        );
    }

    fn enqueue_input(&mut self, data: &[u8]) -> bool {
        match self.serial.enqueue_raw_bytes(data) {
            Ok(n) if n < data.len() => {
                warn!("serial: input fifo full, dropped {} bytes", data.len() - n)
            }
            Ok(_) => (),
            Err(e) => warn!("serial: cannot enqueue input: {:?}", e),
        }
        true
    }
}
