//! Blocking, ordered output writer.
//!
//! Grounded on the reference implementation's `FIFOOutput`/`TCPOutput`: a
//! single writer, written to in order, that never reorders a packet and
//! that may transparently reconnect on a transient write failure — dropping
//! only the packet that failed, not the ones that follow. The orchestrator
//! is unaware of any such retry; it only sees a fatal [`SpliceError::Sink`]
//! if reconnection itself fails or no reconnect policy was configured.

use std::io::Write;

use crate::error::{Result, SpliceError};
use crate::ts::types::TsPacket;

/// Ordered writer of 188-byte packets over any blocking [`Write`], with an
/// optional reconnect factory for transports that can drop and resume (a
/// named pipe whose reader restarts, a TCP socket).
pub struct Sink<W> {
    writer: Option<W>,
    reconnect: Option<Box<dyn FnMut() -> std::io::Result<W> + Send>>,
    packets_written: u64,
    bytes_written: u64,
}

impl<W: Write> Sink<W> {
    /// A sink with no reconnect policy: a write failure is immediately fatal.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
            reconnect: None,
            packets_written: 0,
            bytes_written: 0,
        }
    }

    /// A sink that reopens its underlying writer via `factory` whenever a
    /// write fails. The first connection is made eagerly so a bad endpoint
    /// fails at construction rather than on the first packet.
    pub fn with_reconnect<F>(mut factory: F) -> Result<Self>
    where
        F: FnMut() -> std::io::Result<W> + Send + 'static,
    {
        let writer = factory().map_err(|e| SpliceError::Sink(e.to_string()))?;
        Ok(Self {
            writer: Some(writer),
            reconnect: Some(Box::new(factory)),
            packets_written: 0,
            bytes_written: 0,
        })
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes one packet. On a transient failure with a reconnect policy
    /// configured, reopens the writer and reports success anyway — the
    /// failed packet is dropped, matching the reference implementation's
    /// "packet dropped during reconnection" behavior — so the caller never
    /// has to special-case a single lost packet mid-stream.
    pub fn write_packet(&mut self, packet: &TsPacket) -> Result<()> {
        let write_result = match self.writer.as_mut() {
            Some(w) => w.write_all(packet.as_bytes()),
            None => return self.reconnect_now(),
        };

        match write_result {
            Ok(()) => {
                self.packets_written += 1;
                self.bytes_written += packet.as_bytes().len() as u64;
                Ok(())
            }
            Err(e) => {
                log::warn!("sink write failed: {e}");
                self.writer = None;
                self.reconnect_now()
            }
        }
    }

    pub fn write_packets(&mut self, packets: &[TsPacket]) -> Result<()> {
        for packet in packets {
            self.write_packet(packet)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(w) = self.writer.as_mut() {
            w.flush().map_err(|e| SpliceError::Sink(e.to_string()))?;
        }
        Ok(())
    }

    fn reconnect_now(&mut self) -> Result<()> {
        let Some(factory) = self.reconnect.as_mut() else {
            return Err(SpliceError::Sink("write failed, no reconnect policy".into()));
        };
        log::warn!("sink reconnecting");
        match factory() {
            Ok(w) => {
                self.writer = Some(w);
                Ok(())
            }
            Err(e) => Err(SpliceError::Sink(format!("reconnect failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::types::TS_PACKET_SIZE;

    fn packet() -> TsPacket {
        TsPacket::from_slice(&[0x47u8; TS_PACKET_SIZE]).unwrap()
    }

    #[test]
    fn writes_packets_in_order_without_reconnect() {
        let mut sink = Sink::new(Vec::<u8>::new());
        sink.write_packet(&packet()).unwrap();
        sink.write_packet(&packet()).unwrap();
        assert_eq!(sink.packets_written(), 2);
        assert_eq!(sink.bytes_written(), (TS_PACKET_SIZE * 2) as u64);
    }

    #[test]
    fn no_reconnect_policy_propagates_write_failure() {
        struct AlwaysFails;
        impl Write for AlwaysFails {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let mut sink = Sink::new(AlwaysFails);
        assert!(sink.write_packet(&packet()).is_err());
    }

    #[test]
    fn reconnects_and_drops_only_the_failed_packet() {
        use std::sync::{Arc, Mutex};

        enum TestWriter {
            Failing,
            Working(Arc<Mutex<Vec<u8>>>),
        }
        impl Write for TestWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                match self {
                    TestWriter::Failing => {
                        Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
                    }
                    TestWriter::Working(log) => {
                        log.lock().unwrap().extend_from_slice(buf);
                        Ok(buf.len())
                    }
                }
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_factory = log.clone();
        let mut attempt = 0;
        let mut sink = Sink::with_reconnect(move || {
            attempt += 1;
            if attempt == 1 {
                Ok(TestWriter::Failing)
            } else {
                Ok(TestWriter::Working(log_for_factory.clone()))
            }
        })
        .unwrap();

        // The initial writer (attempt 1) always fails; this packet is
        // dropped and the sink reconnects to a fresh writer instead of
        // erroring out.
        sink.write_packet(&packet()).unwrap();
        assert_eq!(sink.packets_written(), 0);
        assert!(log.lock().unwrap().is_empty());

        // The reconnected writer (attempt 2) works, so this one lands.
        sink.write_packet(&packet()).unwrap();
        assert_eq!(sink.packets_written(), 1);
        assert_eq!(log.lock().unwrap().len(), TS_PACKET_SIZE);
    }
}
