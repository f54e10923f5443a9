//! nRF DFU service & characteristic UUIDs.
//!
//! From the [DFU BLE Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/group__nrf__dfu__ble.html)
//! and [Buttonless DFU Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/service_dfu.html).

use uuid::Uuid;

/// Nordic DFU Service (16-bit UUID 0xFE59).
pub const SERVICE: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);
/// Control Point characteristic (notify + write).
pub const CONTROL_POINT: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
/// Packet Data characteristic (write).
pub const DATA_POINT: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);
/// Buttonless DFU trigger without bonds.
pub const BUTTONLESS_UNBONDED: Uuid = Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
/// Buttonless DFU trigger with bond sharing (SDK 14+).
pub const BUTTONLESS_BONDED: Uuid = Uuid::from_u128(0x8EC90004_F315_4F60_9FB8_838830DAEA50);
