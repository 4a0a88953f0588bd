use crate::error::{Error, Result};
use crate::transport::DfuTransport;

use btleplug::api::{
    AddressType, BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

/// nRF DFU service & characteristic UUIDs
///
/// from [DFU BLE Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/group__nrf__dfu__ble.html)
/// and [Buttonless DFU Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/service_dfu.html)
#[allow(dead_code)]
mod dfu_uuids {
    use uuid::Uuid;
    /// DFU Service (16 bit UUID 0xFE59)
    pub const SERVICE: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);
    /// Control Point Characteristic
    pub const CTRL_PT: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
    /// Data Characteristic
    pub const DATA_PT: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger without bonds Characteristic
    pub const BTTNLSS: Uuid = Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger with bonds Characteristic
    pub const BTTNLSS_WITH_BONDS: Uuid = Uuid::from_u128(0x8EC90004_F315_4F60_9FB8_838830DAEA50);
}

// TODO: read the negotiated ATT MTU once btleplug exposes it; 247 is what
// the nRF5 SDK bootloader requests.
const ATT_MTU: usize = 247;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_secs(5);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// The bootloader advertises one above the application MAC.
fn dfutarg_addr(addr: &BDAddr) -> BDAddr {
    let mut bytes = addr.into_inner();
    bytes[0] = bytes[0].wrapping_add(1);
    BDAddr::from(bytes)
}

fn find_characteristic(peripheral: &Peripheral, uuid: uuid::Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
}

#[cfg(not(target_os = "macos"))]
async fn find_peripheral<P>(central: &Adapter, predicate: P) -> Result<Peripheral>
where
    P: Fn(&PeripheralProperties) -> bool,
{
    central.start_scan(ScanFilter::default()).await?;
    let mut events = central.events().await?;
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let peripheral = central.peripheral(&id).await?;
            if let Some(properties) = peripheral.properties().await? {
                log::trace!(
                    "discovered {} ({:?}, rssi {:?})",
                    properties.address,
                    properties.local_name,
                    properties.rssi
                );
                if predicate(&properties) {
                    central.stop_scan().await?;
                    return Ok(peripheral);
                }
            }
        }
    }
    Err(Error::Connect("scanning stopped unexpectedly".into()))
}

#[cfg(target_os = "macos")]
async fn find_peripheral_by_address(
    _central: &Adapter,
    _addr: &BDAddr,
    _address_type: AddressType,
) -> Result<Peripheral> {
    Err(Error::Connect(
        "BLE MAC addresses are not supported on macOS".into(),
    ))
}

#[cfg(not(target_os = "macos"))]
async fn find_peripheral_by_address(
    central: &Adapter,
    addr: &BDAddr,
    address_type: AddressType,
) -> Result<Peripheral> {
    log::info!("Searching for {} ({:?})...", addr, address_type);
    find_peripheral(central, |props| {
        props.address == *addr && props.address_type.map_or(true, |t| t == address_type)
    })
    .await
}

async fn connect_with_retry(peripheral: &Peripheral, addr: &BDAddr) -> Result<()> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        log::info!(
            "Connecting to {} (attempt {}/{})...",
            addr,
            attempt,
            CONNECT_ATTEMPTS
        );
        match peripheral.connect().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("could not connect to {}: {}", addr, e);
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }
    }
    Err(Error::Connect(format!("gave up connecting to {}", addr)))
}

/// Ask the running application to reboot into the bootloader via the
/// buttonless DFU characteristic and drop the connection, which dies with
/// the reset anyway.
async fn enter_bootloader(peripheral: &Peripheral, buttonless: &Characteristic) -> Result<()> {
    peripheral.subscribe(buttonless).await?;
    let mut notifications = peripheral.notifications().await?;

    log::info!("Entering DFU bootloader...");
    peripheral
        .write(buttonless, &[0x01], WriteType::WithResponse)
        .await?;

    let indication = tokio::time::timeout(NOTIFY_TIMEOUT, async {
        while let Some(ntf) = notifications.next().await {
            if ntf.uuid == buttonless.uuid {
                return Some(ntf.value);
            }
        }
        None
    })
    .await
    .map_err(|_| Error::Timeout)?
    .ok_or_else(|| Error::Connect("notification stream ended".into()))?;

    if indication.get(2) != Some(&0x01) {
        log::error!("unexpected buttonless response: {:02x?}", indication);
    }

    let _ = peripheral.disconnect().await;
    Ok(())
}

/// DFU transport over the vendor GATT service: requests go to the control
/// point with response, payload chunks to the data characteristic without.
pub struct BleTransport {
    peripheral: Peripheral,
    control: Characteristic,
    data: Characteristic,
    notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
}

impl BleTransport {
    /// Connect to the target, reboot it into the bootloader when the
    /// buttonless characteristic is present, and resolve the DFU
    /// characteristics on whatever ends up being DfuTarg.
    pub async fn connect(address: BDAddr, address_type: AddressType) -> Result<Self> {
        let manager = btleplug::platform::Manager::new().await?;
        let adapters = manager.adapters().await?;
        let central = adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::Connect("no Bluetooth adapter found".into()))?;

        let peripheral = find_peripheral_by_address(&central, &address, address_type).await?;
        connect_with_retry(&peripheral, &address).await?;
        peripheral.discover_services().await?;

        let peripheral = match find_characteristic(&peripheral, dfu_uuids::BTTNLSS) {
            Some(buttonless) => {
                enter_bootloader(&peripheral, &buttonless).await?;
                // after the reset the bootloader advertises under a new address
                let target = dfutarg_addr(&address);
                let peripheral =
                    find_peripheral_by_address(&central, &target, address_type).await?;
                connect_with_retry(&peripheral, &target).await?;
                peripheral.discover_services().await?;
                peripheral
            }
            None => {
                log::info!(
                    "No buttonless DFU characteristic, assuming the bootloader is already running"
                );
                peripheral
            }
        };

        let control = find_characteristic(&peripheral, dfu_uuids::CTRL_PT)
            .ok_or_else(|| Error::Connect("DFU control point characteristic not found".into()))?;
        let data = find_characteristic(&peripheral, dfu_uuids::DATA_PT)
            .ok_or_else(|| Error::Connect("DFU data characteristic not found".into()))?;
        peripheral.subscribe(&control).await?;
        let notifications = peripheral.notifications().await?;
        log::debug!("DFU characteristics found");

        Ok(Self {
            peripheral,
            control,
            data,
            notifications,
        })
    }
}

impl DfuTransport for BleTransport {
    fn max_chunk_size(&self) -> Option<usize> {
        Some(ATT_MTU - 3)
    }

    fn response_timeout(&self) -> Duration {
        NOTIFY_TIMEOUT
    }

    async fn send_request(&mut self, frame: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.control, frame, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn send_data(&mut self, chunk: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.data, chunk, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn recv_response(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let control_uuid = self.control.uuid;
        let next = tokio::time::timeout(timeout, async {
            while let Some(ntf) = self.notifications.next().await {
                if ntf.uuid == control_uuid {
                    return Some(ntf.value);
                }
            }
            None
        });
        match next.await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(Error::Connect("notification stream ended".into())),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
