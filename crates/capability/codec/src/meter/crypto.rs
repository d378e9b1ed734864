//! 南硕购买数据加解密
//!
//! 密钥 `x` 为 7 字节表地址的无符号累加和。次数 `y = times ^ x`，
//! 购买量的 4 个字节逐个异或 `x` 后按 `y % 4` 循环左移；解密时按密文次数反向处理。

use crate::checksum::uchar_checksum;

/// 表地址派生的单字节密钥
pub fn address_key(address: &[u8]) -> u8 {
    uchar_checksum(address)
}

/// 加密 (次数, 购买量)，返回 (密文次数, 密文购买量)。
pub fn ns_encrypt(address: &[u8], times: u8, purchases: [u8; 4]) -> (u8, [u8; 4]) {
    let x = address_key(address);
    let y = times ^ x;
    let mut z = purchases.map(|byte| byte ^ x);
    z.rotate_left(usize::from(y % 4));
    (y, z)
}

/// 解密，[`ns_encrypt`] 的逆变换。
pub fn ns_decrypt(address: &[u8], times: u8, purchases: [u8; 4]) -> (u8, [u8; 4]) {
    let x = address_key(address);
    let mut z = purchases;
    z.rotate_right(usize::from(times % 4));
    (times ^ x, z.map(|byte| byte ^ x))
}

/// 对外的购买次数从 1 开始计数，表内从 0 开始，下发前减一并按 256 回绕。
pub fn effective_purchase_times(times: u16) -> u8 {
    times.wrapping_sub(1) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    const WILDCARD: [u8; 7] = [0xAA; 7];

    #[test]
    fn test_encrypt_reference_vector() {
        // x = 0xA6, y = 3 ^ 0xA6 = 0xA5, 旋转 1 位
        let (times, purchases) = ns_encrypt(&WILDCARD, 3, [0xE8, 0x03, 0x00, 0x00]);
        assert_eq!(times, 0xA5);
        assert_eq!(purchases, [0xA5, 0xA6, 0xA6, 0x4E]);

        let decrypted = ns_decrypt(&WILDCARD, times, purchases);
        assert_eq!(decrypted, (3, [0xE8, 0x03, 0x00, 0x00]));
    }

    #[test]
    fn test_encrypt_is_invertible_for_every_times() {
        let addresses = [
            [0x00; 7],
            [0xAA; 7],
            [0xFE; 7],
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77],
        ];
        let purchases = [
            [0x00, 0x00, 0x00, 0x00],
            [0xE8, 0x03, 0x00, 0x00],
            [0x01, 0x02, 0x03, 0x04],
            [0xFF, 0x7F, 0x80, 0x10],
        ];
        for address in &addresses {
            for times in 0..=u8::MAX {
                for amount in &purchases {
                    let (y, z) = ns_encrypt(address, times, *amount);
                    assert_eq!(ns_decrypt(address, y, z), (times, *amount));
                }
            }
        }
    }

    #[test]
    fn test_rotation_uses_times_modulo_four() {
        // x = 0，y = times，旋转次数仅由 y % 4 决定
        let address = [0x00; 7];
        let plain = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(ns_encrypt(&address, 4, plain).1, plain);
        assert_eq!(ns_encrypt(&address, 6, plain).1, [0x03, 0x04, 0x01, 0x02]);
        assert_eq!(ns_encrypt(&address, 7, plain).1, [0x04, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_effective_purchase_times_boundaries() {
        assert_eq!(effective_purchase_times(0), 255);
        assert_eq!(effective_purchase_times(1), 0);
        assert_eq!(effective_purchase_times(3), 2);
        assert_eq!(effective_purchase_times(255), 254);
        assert_eq!(effective_purchase_times(256), 255);
        assert_eq!(effective_purchase_times(257), 0);
    }
}
