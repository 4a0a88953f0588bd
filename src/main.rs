mod error;
mod image;
mod package;
mod protocol;
mod slip;
mod transport;
mod transport_btleplug;
mod transport_serial;

use anyhow::{Context, anyhow};
use btleplug::api::BDAddr;
use clap::{Parser, Subcommand, ValueEnum};
use std::str::FromStr;

use image::MemImage;

/// Update firmware on devices running the Nordic Secure DFU bootloader
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// DFU package (.zip) path
    package: String,

    /// Manifest component to flash
    #[arg(long, default_value = "application")]
    component: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    transport: Transport,
}

#[derive(Subcommand)]
enum Transport {
    /// Upgrade over a SLIP-framed serial link
    Serial {
        /// Serial port device, e.g. /dev/ttyUSB0
        port: String,

        #[arg(long, default_value_t = transport_serial::DEFAULT_BAUD)]
        baud: u32,
    },
    /// Upgrade over BLE GATT
    Ble {
        /// Target address (AA:BB:CC:DD:EE:FF)
        address: String,

        /// Address type the target advertises with
        #[arg(long, value_enum, default_value_t = AddrType::Random)]
        address_type: AddrType,
    },
}

#[derive(Copy, Clone, ValueEnum)]
enum AddrType {
    Public,
    Random,
}

impl From<AddrType> for btleplug::api::AddressType {
    fn from(value: AddrType) -> Self {
        match value {
            AddrType::Public => btleplug::api::AddressType::Public,
            AddrType::Random => btleplug::api::AddressType::Random,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::builder()
        .filter_level(args.log_level)
        .parse_default_env()
        .init();

    let (dat, bin) = package::extract(&args.package, &args.component)?;
    let mut init = MemImage::from(dat);
    let mut firmware = MemImage::from(bin);

    match args.transport {
        Transport::Serial { port, baud } => {
            let mut transport = transport_serial::SerialTransport::open(&port, baud)
                .with_context(|| format!("cannot open serial port `{}`", port))?;
            protocol::dfu_run(&mut transport, &mut init, &mut firmware).await?;
        }
        Transport::Ble {
            address,
            address_type,
        } => {
            let address =
                BDAddr::from_str(&address).map_err(|e| anyhow!("invalid BLE address: {}", e))?;
            let mut transport =
                transport_btleplug::BleTransport::connect(address, address_type.into()).await?;
            protocol::dfu_run(&mut transport, &mut init, &mut firmware).await?;
        }
    }

    Ok(())
}
