use crate::error::{Error, Result};
use crate::protocol::OpCode;
use crate::slip;
use crate::transport::DfuTransport;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

pub const DEFAULT_BAUD: u32 = 115_200;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// SLIP-framed DFU transport over a serial port.
///
/// Control requests and OBJECT_WRITE chunks travel the same way here: as
/// SLIP frames carrying `[opcode][payload]`.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    scratch: Vec<u8>,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        log::debug!("opening {} at {} baud", path, baud);
        let mut port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(RESPONSE_TIMEOUT)
            .open()?;
        // Some USB CDC bootloaders never answer until DTR is asserted.
        port.write_data_terminal_ready(true)?;
        Ok(Self {
            port,
            scratch: Vec::new(),
        })
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.scratch.clear();
        slip::encode(frame, &mut self.scratch);
        self.port.write_all(&self.scratch)?;
        self.port.flush()?;
        Ok(())
    }
}

impl DfuTransport for SerialTransport {
    fn max_chunk_size(&self) -> Option<usize> {
        // unknown until the target's serial MTU has been queried
        None
    }

    fn response_timeout(&self) -> Duration {
        RESPONSE_TIMEOUT
    }

    async fn send_request(&mut self, frame: &[u8]) -> Result<()> {
        self.write_frame(frame)
    }

    async fn send_data(&mut self, chunk: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(chunk.len() + 1);
        frame.push(u8::from(OpCode::ObjectWrite));
        frame.extend_from_slice(chunk);
        self.write_frame(&frame)
    }

    async fn recv_response(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut decoder = slip::Decoder::new();
        let mut byte = [0u8; 1];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(Error::Timeout)?;
            self.port.set_timeout(remaining)?;
            match self.port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => {
                    if let Some(frame) = decoder.push(byte[0])? {
                        return Ok(frame);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(Error::Timeout),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }
}
