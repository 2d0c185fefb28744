//! GATT Protocol Constants
//!
//! Well-known service and characteristic UUIDs exposed by the iOS peripheral,
//! and the descriptor used to enable notifications.

use crate::domain::models::CharacteristicAddress;
use uuid::Uuid;

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Default ATT MTU before negotiation
pub const DEFAULT_MTU: u16 = 23;

/// Apple Notification Center Service
pub mod ancs {
    use super::*;

    pub const SERVICE: Uuid = Uuid::from_u128(0x7905f431_b5ce_4e99_a40f_4b1e122d00d0);
    pub const NOTIFICATION_SOURCE: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x9fbf120d_6301_42d9_8c58_25e699a21dbd),
    );
    pub const DATA_SOURCE: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x22eac6e9_24d6_4bb5_be44_b36ace7c7bfb),
    );
    pub const CONTROL_POINT: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x69d1d8f3_45e1_49a8_9821_9bbdfdaad9d9),
    );
}

/// Apple Media Service
pub mod ams {
    use super::*;

    pub const SERVICE: Uuid = Uuid::from_u128(0x89d3502b_0f36_433a_8ef4_c502ad55f8dc);
    pub const REMOTE_COMMAND: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x9b3c81d8_57b1_4a8a_b8df_0e56f7ca51c2),
    );
    pub const ENTITY_UPDATE: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x2f7cabce_808d_411f_9a0c_bb92ba96c102),
    );
    pub const ENTITY_ATTRIBUTE: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0xc6b2f38c_23ab_46d8_a6ab_a3a870bbd5d7),
    );
}

/// Battery Service
pub mod battery {
    use super::*;

    pub const SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
    pub const BATTERY_LEVEL: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb),
    );
}

/// Current Time Service
pub mod current_time {
    use super::*;

    pub const SERVICE: Uuid = Uuid::from_u128(0x00001805_0000_1000_8000_00805f9b34fb);
    pub const CURRENT_TIME: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x00002a2b_0000_1000_8000_00805f9b34fb),
    );
    pub const LOCAL_TIME_INFORMATION: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x00002a0f_0000_1000_8000_00805f9b34fb),
    );
    pub const REFERENCE_TIME_INFORMATION: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x00002a14_0000_1000_8000_00805f9b34fb),
    );
}

/// Vendor service published by the Aerlink iOS companion app
pub mod aerlink {
    use super::*;

    pub const SERVICE: Uuid = Uuid::from_u128(0x0d6a2c7d_392a_4781_b432_db437f70f643);
    pub const CAMERA_REMOTE_DATA: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x7be5ff0a_e736_453a_9257_c94fffdc6a97),
    );
    pub const CAMERA_REMOTE_ACTION: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x19c3577c_0952_4dc1_b03e_3db3fffc381a),
    );
    pub const REMINDERS_DATA: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x1e082d2c_c279_4f49_a63c_a70c74f562d6),
    );
    pub const REMINDERS_ACTION: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0xb708a912_5d7e_4baf_8a63_f915c6717050),
    );
    pub const UTILS_DATA: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0x96eaff02_2e7a_4013_91a7_81581c6a7a4b),
    );
    pub const UTILS_ACTION: CharacteristicAddress = CharacteristicAddress::new(
        SERVICE,
        Uuid::from_u128(0xe476843e_02c9_4ac5_9ca8_6bda217b225f),
    );
}
