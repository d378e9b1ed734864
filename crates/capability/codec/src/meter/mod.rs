//! CJ/T188 表计协议与南硕命令族

mod crypto;
mod frame;
mod nan_suo;

pub use crypto::{address_key, effective_purchase_times, ns_decrypt, ns_encrypt};
pub use frame::{
    ADDRESS_LEN, DataField, DecodedFrame, FRAME_END, FRAME_HEAD, FRAME_PREAMBLE, FieldLayout,
    FieldName, HEADER_LEN, MeterFrame, peek_seq, scan_frame,
};
pub use nan_suo::{
    BROADCAST_ADDRESS, NsCommand, NsCommandKind, NsRequest, NsResponse, ResetKind, ValveState,
    WILDCARD_ADDRESS,
};

use crate::error::CodecError;

/// 解析 14 位十六进制表地址
pub fn parse_address(text: &str) -> Result<[u8; ADDRESS_LEN], CodecError> {
    let bytes =
        hex::decode(text.trim()).map_err(|err| CodecError::InvalidValue(err.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CodecError::AddressLength(len))
}

/// 表地址的十六进制表示（大写）
pub fn format_address(address: &[u8]) -> String {
    hex::encode_upper(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("11223344556677").unwrap(),
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]
        );
        assert_eq!(parse_address("1122"), Err(CodecError::AddressLength(2)));
        assert!(matches!(
            parse_address("zz"),
            Err(CodecError::InvalidValue(_))
        ));
        assert_eq!(format_address(&[0xAA, 0x0B]), "AA0B");
    }
}
