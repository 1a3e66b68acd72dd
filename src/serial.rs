//! [`Transport`] over a local serial port (M-Bus level converter).
use crate::{protocol as proto, traits::Transport};
use std::io::{self, Read, Write};
use std::time::Duration;

pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::Even;
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// Read timeout of the port; reads only happen after data was reported.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

pub fn serial_port_builder(
    device: &str,
    baud_rate: &proto::BaudRate,
) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, u32::from(*baud_rate))
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(READ_TIMEOUT)
}

/// Non-blocking view of an opened serial port.
pub struct SerialTransport {
    port: Box<dyn tokio_serial::SerialPort>,
}

impl SerialTransport {
    pub fn open(device: &str, baud_rate: &proto::BaudRate) -> tokio_serial::Result<Self> {
        let port = serial_port_builder(device, baud_rate).open()?;
        Ok(Self { port })
    }

    pub fn new(port: Box<dyn tokio_serial::SerialPort>) -> Self {
        Self { port }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port.name())
            .finish()
    }
}

impl Transport for SerialTransport {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        // Drop stale bytes of an earlier, late answer.
        self.port.clear(tokio_serial::ClearBuffer::Input)?;
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn available_bytes(&mut self) -> io::Result<usize> {
        let pending = self.port.bytes_to_read()?;
        Ok(usize::try_from(pending).unwrap_or(usize::MAX))
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.port.read_exact(&mut byte)?;
        Ok(byte[0])
    }
}
