use crate::error::Result;
use std::time::Duration;

/// DFU transport interface
///
/// The protocol engine is generic over this trait; the serial and BLE
/// implementations decide how control frames and payload chunks reach the
/// target. The protocol is strictly request/response, so implementations
/// only ever hold one pending exchange.
pub trait DfuTransport {
    /// Largest OBJECT_WRITE payload the link accepts, when the transport
    /// knows it up front. `None` means the engine has to query the target's
    /// serial MTU instead.
    fn max_chunk_size(&self) -> Option<usize>;

    /// How long to wait for a response before giving up.
    fn response_timeout(&self) -> Duration;

    /// Send a control request frame (opcode plus parameters).
    async fn send_request(&mut self, frame: &[u8]) -> Result<()>;

    /// Send one OBJECT_WRITE payload chunk, without the opcode byte.
    async fn send_data(&mut self, chunk: &[u8]) -> Result<()>;

    /// Wait for the next response frame.
    async fn recv_response(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Release the underlying link.
    async fn close(&mut self) -> Result<()>;
}
