use crate::error::{Error, Result};
use crate::image::ImageSource;
use crate::transport::DfuTransport;

use indicatif::ProgressBar;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::time::Duration;

// As defined in nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.h

/// DFU Object variants
#[derive(Debug, Copy, Clone, IntoPrimitive)]
#[repr(u8)]
pub enum ObjectType {
    /// Init packet
    Command = 0x01,
    /// Firmware image
    Data = 0x02,
}

/// DFU Command opcodes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    ProtocolVersion = 0x00,
    ObjectCreate = 0x01,
    ReceiptNotifSet = 0x02,
    CrcGet = 0x03,
    ObjectExecute = 0x04,
    ObjectSelect = 0x06,
    MtuGet = 0x07,
    ObjectWrite = 0x08,
    Ping = 0x09,
    HardwareVersion = 0x0A,
    FirmwareVersion = 0x0B,
    Abort = 0x0C,
    Response = 0x60,
}

/// DFU Response codes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtError = 0x0B,
}

pub fn crc32(buf: &[u8], init: u32) -> u32 {
    let mut h = crc32fast::Hasher::new_with_initial(init);
    h.update(buf);
    h.finalize()
}

/// DFU Requests
///
/// More requests are available when `NRF_DFU_PROTOCOL_REDUCED` is not defined
/// in `nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.c`.
/// OBJECT_WRITE is not represented here: payload chunks bypass the control
/// path and go through [`DfuTransport::send_data`].
#[derive(Debug)]
enum Request {
    Ping(u8),
    /// Set Packet Receipt Notification frequency
    SetPrn(u16),
    MtuGet,
    /// Select object
    Select(ObjectType),
    /// Create DFU object
    Create(ObjectType, u32),
    /// Get current offset and CRC
    GetCrc,
    /// Execute current DFU object
    Execute,
    /// Discard the current object
    Abort,
}

impl Request {
    fn opcode(&self) -> OpCode {
        match self {
            Request::Ping(_) => OpCode::Ping,
            Request::SetPrn(_) => OpCode::ReceiptNotifSet,
            Request::MtuGet => OpCode::MtuGet,
            Request::Select(_) => OpCode::ObjectSelect,
            Request::Create(..) => OpCode::ObjectCreate,
            Request::GetCrc => OpCode::CrcGet,
            Request::Execute => OpCode::ObjectExecute,
            Request::Abort => OpCode::Abort,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = vec![self.opcode().into()];
        match self {
            Request::Ping(id) => bytes.push(*id),
            Request::SetPrn(value) => bytes.extend_from_slice(&value.to_le_bytes()),
            Request::Select(obj_type) => bytes.push((*obj_type).into()),
            Request::Create(obj_type, len) => {
                bytes.push((*obj_type).into());
                bytes.extend_from_slice(&len.to_le_bytes());
            }
            Request::MtuGet | Request::GetCrc | Request::Execute | Request::Abort => {}
        }
        bytes
    }
}

/// What the target reports for an object type on SELECT.
#[derive(Debug, Clone, Copy)]
pub struct ObjectStatus {
    pub max_size: u32,
    pub offset: u32,
    pub crc: u32,
}

/// Validate the `[0x60][echoed opcode][result]` header and return the bytes
/// after it. Anything that does not parse as a response to `opcode` is a
/// fatal protocol error.
fn check_response(opcode: OpCode, bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < 3 {
        return Err(Error::Protocol(format!(
            "short response to {:?}: {:02x?}",
            opcode, bytes
        )));
    }
    if bytes[0] != u8::from(OpCode::Response) {
        return Err(Error::Protocol(format!(
            "response does not start with 0x60: {:02x?}",
            bytes
        )));
    }
    if bytes[1] != u8::from(opcode) {
        return Err(Error::Protocol(format!(
            "response opcode mismatch: sent {:?}, target answered {:#04x}",
            opcode, bytes[1]
        )));
    }
    let code = ResultCode::try_from(bytes[2])
        .map_err(|_| Error::Protocol(format!("unknown result code {:#04x}", bytes[2])))?;
    if code != ResultCode::Success {
        let ext = (code == ResultCode::ExtError)
            .then(|| bytes.get(3).copied())
            .flatten();
        if let Some(ext) = ext {
            log::error!("{:?} failed with extended error {:#04x}", opcode, ext);
        }
        return Err(Error::Remote { opcode, code, ext });
    }
    Ok(&bytes[3..])
}

fn read_u16_le(payload: &[u8], at: usize) -> Result<u16> {
    let bytes: [u8; 2] = payload
        .get(at..at + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::Protocol("truncated response payload".into()))?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32_le(payload: &[u8], at: usize) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::Protocol("truncated response payload".into()))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Host position in a partially stored object, recovered from the image.
struct ResumePoint {
    /// Running CRC over everything the target holds.
    crc: u32,
    /// CRC at the start of the object containing the resume offset, needed
    /// if that object later has to be re-sent.
    object_crc: u32,
}

/// Recompute the running CRC over the `status.offset` bytes the target
/// already holds. `None` means the stored bytes cannot belong to this image.
/// The scratch buffer never grows beyond one chunk.
fn resume_state<S: ImageSource>(
    source: &mut S,
    total: u32,
    status: &ObjectStatus,
    chunk_size: usize,
) -> Result<Option<ResumePoint>> {
    if status.offset > total {
        return Ok(None);
    }
    source.rewind_to(0)?;
    let mut buf = vec![0u8; chunk_size];
    let object_start = status.offset - status.offset % status.max_size;
    let object_crc = advance_crc(source, &mut buf, object_start, 0)?;
    let crc = advance_crc(source, &mut buf, status.offset - object_start, object_crc)?;
    Ok((crc == status.crc).then_some(ResumePoint { crc, object_crc }))
}

fn advance_crc<S: ImageSource>(
    source: &mut S,
    buf: &mut [u8],
    len: u32,
    seed: u32,
) -> Result<u32> {
    let mut crc = seed;
    let mut remaining = len as usize;
    while remaining > 0 {
        let n = buf.len().min(remaining);
        source.read_exact(&mut buf[..n])?;
        crc = crc32(&buf[..n], crc);
        remaining -= n;
    }
    Ok(crc)
}

/// Protocol engine for one upgrade session against a Secure DFU bootloader.
pub struct DfuTarget<'a, T: DfuTransport> {
    transport: &'a mut T,
    chunk_size: usize,
    ping_id: u8,
    /// Bytes of the current object type the target has confirmed or is
    /// about to confirm, and the CRC over them.
    offset: u32,
    crc: u32,
}

impl<'a, T: DfuTransport> DfuTarget<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        let chunk_size = transport.max_chunk_size().unwrap_or(0);
        Self {
            transport,
            chunk_size,
            ping_id: 0,
            offset: 0,
            crc: 0,
        }
    }

    async fn request(&mut self, req: Request) -> Result<Vec<u8>> {
        let frame = req.to_bytes();
        log::trace!("--> {:02x?}", frame);
        self.transport.send_request(&frame).await?;
        let timeout = self.transport.response_timeout();
        let raw = self.transport.recv_response(timeout).await?;
        log::trace!("<-- {:02x?}", raw);
        Ok(check_response(req.opcode(), &raw)?.to_vec())
    }

    /// Liveness probe. Timeouts, rejections and a wrong echo all count as
    /// "not ready yet" rather than failures.
    pub async fn ping(&mut self) -> Result<bool> {
        self.ping_id = self.ping_id.wrapping_add(1);
        match self.request(Request::Ping(self.ping_id)).await {
            Ok(payload) => Ok(payload.first() == Some(&self.ping_id)),
            Err(Error::Timeout) => Ok(false),
            Err(Error::Remote { code, .. }) => {
                log::debug!("ping rejected with {:?}", code);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn set_prn(&mut self, prn: u16) -> Result<()> {
        match self.request(Request::SetPrn(prn)).await {
            Ok(_) => Ok(()),
            Err(Error::Remote {
                code: ResultCode::OperationNotPermitted,
                ..
            }) => {
                log::warn!("target denied receipt notification setup, assuming PRN is off");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Establish the OBJECT_WRITE payload size: taken from the transport
    /// when it knows its link (BLE), otherwise derived from the target's
    /// serial MTU.
    pub async fn negotiate_chunk_size(&mut self) -> Result<()> {
        if let Some(size) = self.transport.max_chunk_size() {
            self.chunk_size = size;
        } else {
            let payload = self.request(Request::MtuGet).await?;
            let mtu = read_u16_le(&payload, 0)?;
            if mtu < 5 {
                return Err(Error::Protocol(format!("unusable serial MTU {}", mtu)));
            }
            // A write frame is the opcode plus the chunk; SLIP encoding can
            // double every byte and appends one END.
            self.chunk_size = (mtu as usize - 1) / 2 - 1;
        }
        log::debug!("chunk size = {} bytes", self.chunk_size);
        Ok(())
    }

    async fn select(&mut self, kind: ObjectType) -> Result<ObjectStatus> {
        let payload = self.request(Request::Select(kind)).await?;
        Ok(ObjectStatus {
            max_size: read_u32_le(&payload, 0)?,
            offset: read_u32_le(&payload, 4)?,
            crc: read_u32_le(&payload, 8)?,
        })
    }

    async fn create(&mut self, kind: ObjectType, size: u32) -> Result<()> {
        self.request(Request::Create(kind, size)).await?;
        Ok(())
    }

    async fn get_crc(&mut self) -> Result<(u32, u32)> {
        let payload = self.request(Request::GetCrc).await?;
        Ok((read_u32_le(&payload, 0)?, read_u32_le(&payload, 4)?))
    }

    async fn execute(&mut self) -> Result<()> {
        self.request(Request::Execute).await?;
        Ok(())
    }

    /// Discard whatever transfer is in progress. The bootloader answers
    /// ABORT through the same response pipeline as every other request, so
    /// the acknowledgement must be drained before the next exchange.
    async fn abort(&mut self) -> Result<()> {
        self.request(Request::Abort).await?;
        Ok(())
    }

    /// Transfer one object type completely: select, resume if the target
    /// already holds a matching prefix, then create/stream/verify/execute
    /// objects of at most `max_size` bytes until the image is committed.
    pub async fn write_object<S: ImageSource>(
        &mut self,
        kind: ObjectType,
        source: &mut S,
    ) -> Result<()> {
        let total = source.size();
        if total == 0 {
            return Err(Error::Source("refusing to transfer an empty image".into()));
        }

        let status = self.select(kind).await?;
        log::debug!(
            "{:?} object status: max_size {}, offset {}, crc {:#010x}",
            kind,
            status.max_size,
            status.offset,
            status.crc
        );
        let max_size = status.max_size;
        if max_size == 0 {
            return Err(Error::Protocol("target reports zero object size".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Protocol("chunk size has not been negotiated".into()));
        }

        self.offset = 0;
        self.crc = 0;
        let mut object_crc = 0u32;

        if status.offset > 0 {
            match resume_state(source, total, &status, self.chunk_size)? {
                Some(resume) => {
                    log::info!("resuming {:?} object at offset {}", kind, status.offset);
                    self.offset = status.offset;
                    self.crc = resume.crc;
                    object_crc = resume.object_crc;
                }
                None => {
                    log::warn!(
                        "stored {:?} object does not match the local image, restarting",
                        kind
                    );
                    self.abort().await?;
                    source.rewind_to(0)?;
                }
            }
        } else {
            source.rewind_to(0)?;
        }

        let fully_stored = self.offset == total;

        let progress = match kind {
            ObjectType::Data => ProgressBar::new(total as u64),
            ObjectType::Command => ProgressBar::hidden(),
        };
        progress.set_position(self.offset as u64);

        // Object we already re-sent once; a second CRC failure there is fatal.
        let mut retried_at = None;

        while self.offset < total {
            let object_start = self.offset - self.offset % max_size;
            let object_end = (object_start + max_size).min(total);
            if self.offset == object_start {
                object_crc = self.crc;
                self.create(kind, object_end - object_start).await?;
            }

            self.stream(source, object_end, &progress).await?;

            let (target_offset, target_crc) = self.get_crc().await?;
            if target_offset == self.offset && target_crc == self.crc {
                self.execute().await?;
                continue;
            }

            if retried_at == Some(object_start) {
                progress.abandon();
                return Err(Error::CrcMismatch {
                    host_offset: self.offset,
                    host_crc: self.crc,
                    target_offset,
                    target_crc,
                });
            }
            log::warn!(
                "CRC mismatch at offset {} (host {:#010x}, target {:#010x}), re-sending object",
                self.offset,
                self.crc,
                target_crc
            );
            retried_at = Some(object_start);
            self.abort().await?;
            source.rewind_to(object_start)?;
            self.offset = object_start;
            self.crc = object_crc;
            progress.set_position(self.offset as u64);
        }

        if fully_stored {
            // Everything already sat on the target; the interrupted session
            // may still have died before committing the final object.
            self.execute().await?;
        }

        progress.finish_and_clear();
        Ok(())
    }

    async fn stream<S: ImageSource>(
        &mut self,
        source: &mut S,
        end: u32,
        progress: &ProgressBar,
    ) -> Result<()> {
        let mut buf = vec![0u8; self.chunk_size];
        while self.offset < end {
            let n = self.chunk_size.min((end - self.offset) as usize);
            source.read_exact(&mut buf[..n])?;
            self.transport.send_data(&buf[..n]).await?;
            self.crc = crc32(&buf[..n], self.crc);
            self.offset += n as u32;
            progress.set_position(self.offset as u64);
        }
        Ok(())
    }
}

const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Run a full DFU upgrade: wait for the bootloader, disable receipt
/// notifications, negotiate the chunk size, then transfer the init packet
/// and the firmware image. The transport is closed on every exit path.
///
/// [DFU Protocol](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/lib_dfu_transport.html)
pub async fn dfu_run<T, I, F>(transport: &mut T, init: &mut I, firmware: &mut F) -> Result<()>
where
    T: DfuTransport,
    I: ImageSource,
    F: ImageSource,
{
    let result = upgrade(transport, init, firmware).await;
    if let Err(e) = transport.close().await {
        log::warn!("closing transport failed: {}", e);
    }
    result
}

async fn upgrade<T, I, F>(transport: &mut T, init: &mut I, firmware: &mut F) -> Result<()>
where
    T: DfuTransport,
    I: ImageSource,
    F: ImageSource,
{
    let mut target = DfuTarget::new(transport);

    log::info!("Waiting for the bootloader to answer...");
    while !target.ping().await? {
        tokio::time::sleep(PING_INTERVAL).await;
    }

    // Receipt notifications stay off; the CRC is polled at object boundaries.
    target.set_prn(0).await?;
    target.negotiate_chunk_size().await?;

    log::info!("Sending init packet ({} bytes)...", init.size());
    target.write_object(ObjectType::Command, init).await?;

    log::info!("Sending firmware image ({} bytes)...", firmware.size());
    target.write_object(ObjectType::Data, firmware).await?;

    log::info!("Done.");
    Ok(())
}
