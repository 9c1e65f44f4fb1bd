//! Control-channel receive path.
//!
//! The receive callback pushes raw bytes into an `rtrb` ring, which never
//! blocks. The dispatcher thread drains the ring through [`LineFramer`], which
//! keeps only the command alphabet, resets on anything else and emits a
//! message at each carriage return.

use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};

use crate::{
    command::CommandDispatcher,
    device::FrontEnd,
    monitoring::PipelineMonitor,
};

/// Bytes buffered between the receive callback and the dispatcher
pub const RX_QUEUE_CAPACITY: usize = 256;
/// Longest line the framer will hold, terminator included
pub const LINE_CAPACITY: usize = 32;

/// Receive-callback end of the control channel
pub struct RxProducer {
    producer: Producer<u8>,
    monitor: Arc<PipelineMonitor>,
}

/// Dispatcher-thread end of the control channel
pub struct ControlReader {
    consumer: Consumer<u8>,
    framer: LineFramer,
}

pub fn control_channel(
    capacity: usize,
    monitor: Arc<PipelineMonitor>,
) -> (RxProducer, ControlReader) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        RxProducer { producer, monitor },
        ControlReader {
            consumer,
            framer: LineFramer::default(),
        },
    )
}

impl RxProducer {
    /// Byte received. Dropped (and counted) when the ring is full.
    pub fn on_rx_byte(&mut self, byte: u8) {
        if self.producer.push(byte).is_err() {
            self.monitor.rx_byte_dropped();
        }
    }

    pub fn on_rx(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.on_rx_byte(b);
        }
    }
}

impl ControlReader {
    /// Drain everything received so far, dispatching each complete line.
    /// Returns how many lines were dispatched.
    pub fn poll<F: FrontEnd>(&mut self, dispatcher: &mut CommandDispatcher<F>) -> usize {
        let mut lines = 0;
        while let Ok(byte) = self.consumer.pop() {
            if let Some(line) = self.framer.push(byte) {
                dispatcher.on_command_received(line);
                lines += 1;
            }
        }
        lines
    }
}

/// Carriage-return line assembler for the control alphabet.
///
/// A line containing a byte outside the alphabet, or running past
/// [`LINE_CAPACITY`], is thrown away whole: nothing is collected again until
/// the next `\r`.
#[derive(Debug)]
pub struct LineFramer {
    buf: [u8; LINE_CAPACITY],
    len: usize,
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
            discarding: false,
        }
    }
}

fn is_command_byte(b: u8) -> bool {
    matches!(b, b'0'..=b'9' | b'A'..=b'Z' | b':' | b'-' | b'.')
}

impl LineFramer {
    /// Feed one byte, getting back a complete line (without the `\r`) when
    /// this byte terminated one
    pub fn push(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\r' {
            let n = self.len;
            self.len = 0;
            if std::mem::take(&mut self.discarding) {
                return None;
            }
            return Some(&self.buf[..n]);
        }
        if self.discarding {
            return None;
        }
        if !is_command_byte(byte) || self.len == LINE_CAPACITY - 1 {
            // Leave room for the terminator
            self.len = 0;
            self.discarding = true;
            return None;
        }
        self.buf[self.len] = byte;
        self.len += 1;
        None
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Whether the current line has already been rejected
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::DeviceConfigStore, sim::LoggingFrontEnd};

    fn feed(framer: &mut LineFramer, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes
            .iter()
            .filter_map(|&b| framer.push(b).map(<[u8]>::to_vec))
            .collect()
    }

    #[test]
    fn frames_lines() {
        let mut f = LineFramer::default();
        assert_eq!(feed(&mut f, b"M:5\rSCO:-0.25\r"), vec![b"M:5".to_vec(), b"SCO:-0.25".to_vec()]);
    }

    #[test]
    fn invalid_byte_drops_line() {
        let mut f = LineFramer::default();
        // lowercase is outside the alphabet
        assert!(feed(&mut f, b"M:x5\r").is_empty());
        assert!(f.pending().is_empty() && !f.is_discarding());
        assert_eq!(feed(&mut f, b"M:5\r"), vec![b"M:5".to_vec()]);
    }

    #[test]
    fn overlong_line_is_dropped_whole() {
        let mut f = LineFramer::default();
        let mut long = vec![b'X'; LINE_CAPACITY];
        long.extend_from_slice(b"ON\r");
        assert!(feed(&mut f, &long).is_empty());
        assert!(!f.is_discarding());
        assert_eq!(feed(&mut f, b"ON\r"), vec![b"ON".to_vec()]);
    }

    #[test]
    fn garbage_tail_never_dispatches() {
        let monitor = Arc::new(PipelineMonitor::new());
        let store = Arc::new(DeviceConfigStore::default());
        let mut dispatcher = CommandDispatcher::new(
            Arc::clone(&store),
            LoggingFrontEnd::default(),
            Arc::clone(&monitor),
        );
        let (mut rx, mut reader) = control_channel(RX_QUEUE_CAPACITY, Arc::clone(&monitor));
        rx.on_rx(&[b'X'; 32]);
        rx.on_rx(b"ON\r");
        assert_eq!(reader.poll(&mut dispatcher), 0);
        assert!(!store.is_power_on());
        rx.on_rx(b"\x07ON\rON\r");
        assert_eq!(reader.poll(&mut dispatcher), 1);
        assert!(store.is_power_on());
    }

    #[test]
    fn reader_dispatches() {
        let monitor = Arc::new(PipelineMonitor::new());
        let store = Arc::new(DeviceConfigStore::default());
        let mut dispatcher = CommandDispatcher::new(
            Arc::clone(&store),
            LoggingFrontEnd::default(),
            Arc::clone(&monitor),
        );
        let (mut rx, mut reader) = control_channel(16, Arc::clone(&monitor));
        rx.on_rx(b"ON\rSTART\rM:");
        assert_eq!(reader.poll(&mut dispatcher), 2);
        assert!(store.is_power_on() && store.is_streaming_armed());
        rx.on_rx(b"2\r");
        assert_eq!(reader.poll(&mut dispatcher), 1);
        assert_eq!(store.snapshot().mux, 2);
    }

    #[test]
    fn full_ring_drops_bytes() {
        let monitor = Arc::new(PipelineMonitor::new());
        let (mut rx, _reader) = control_channel(4, Arc::clone(&monitor));
        rx.on_rx(b"START\r");
        assert_eq!(monitor.snapshot().rx_bytes_dropped, 2);
    }
}
