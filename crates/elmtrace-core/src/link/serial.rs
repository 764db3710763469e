//! Serial-port realization of the transport boundary.
//!
//! On Linux a bound RFCOMM channel appears as `/dev/rfcomm*`, which is a
//! plain tty; `serialport` drives it the same way it drives a USB adapter.
//! A tty has no passive side, so this provider only dials outbound.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{LinkListener, LinkProvider, TransportLink};

/// Default baud rate for RFCOMM ttys. The kernel ignores it for Bluetooth
/// but serialport requires one to open the device.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Short read timeout so `shutdown()` can unblock a pending read
/// at the next poll.
const READ_POLL: Duration = Duration::from_millis(100);

/// A serial tty as a [`TransportLink`].
///
/// The port is cloned into independent reader and writer halves so framed
/// reads do not serialize against writes.
pub struct SerialLink {
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
    closed: AtomicBool,
    peer: String,
}

impl SerialLink {
    /// Open `path` and configure it 8N1 without flow control.
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let mut port = serialport::new(path, baud_rate)
            .timeout(READ_POLL)
            .open()
            .map_err(to_io)?;
        configure(port.as_mut())?;
        let writer = port.try_clone().map_err(to_io)?;
        tracing::debug!(path, baud_rate, "opened serial link");
        Ok(Self {
            reader: Mutex::new(port),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            peer: path.to_string(),
        })
    }
}

fn to_io(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Standard 8N1 configuration, no flow control.
fn configure(port: &mut dyn SerialPort) -> io::Result<()> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(to_io)?;
    port.set_parity(serialport::Parity::None).map_err(to_io)?;
    port.set_stop_bits(serialport::StopBits::One).map_err(to_io)?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(to_io)?;
    Ok(())
}

impl TransportLink for SerialLink {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }
        let mut port = self.writer.lock().expect("serial writer poisoned");
        port.write_all(buf)
    }

    fn read_byte(&self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let mut port = self.reader.lock().expect("serial reader poisoned");
            match port.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    // poll again, checking the closed flag
                    continue;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// [`LinkProvider`] over RFCOMM ttys. Outbound only.
#[derive(Debug, Clone)]
pub struct SerialLinkProvider {
    /// Baud rate used when opening the tty.
    pub baud_rate: u32,
}

impl Default for SerialLinkProvider {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl LinkProvider for SerialLinkProvider {
    fn listen(&self) -> io::Result<Box<dyn LinkListener>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "a tty cannot accept inbound connections",
        ))
    }

    fn connect(&self, peer: &str) -> io::Result<Box<dyn TransportLink>> {
        Ok(Box::new(SerialLink::open(peer, self.baud_rate)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_is_unsupported() {
        let provider = SerialLinkProvider::default();
        let err = provider.listen().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
