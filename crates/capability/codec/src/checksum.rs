//! 校验和

use crc::{CRC_16_MODBUS, Crc};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// 按字节无符号累加，每加一个字节截断到 8 位。
pub fn uchar_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Modbus RTU 的 CRC-16，线路上低字节在前。
pub fn crc16_modbus(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}
