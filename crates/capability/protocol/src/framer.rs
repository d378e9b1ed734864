//! 会话分帧
//!
//! 认证前，一次读到的全部字节就是令牌；认证后按帧格式从字节流中切帧。

use crate::config::FrameMethod;
use bytes::{Bytes, BytesMut};
use ems_codec::FrameScan;
use ems_codec::meter::scan_frame;
use ems_codec::modbus_rtu::scan_rtu_frame;
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// 缓冲区上限，超过后清空并重新同步
const MAX_BUFFER: usize = 8 * 1024;

/// 入站数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// 认证前的令牌负载
    Token(Bytes),
    /// 认证后切出的一帧
    Frame(Bytes),
}

#[derive(Debug)]
pub struct SessionCodec {
    method: FrameMethod,
    authenticated: bool,
}

impl SessionCodec {
    pub fn new(method: FrameMethod) -> Self {
        Self {
            method,
            authenticated: false,
        }
    }

    /// 认证通过后切换到帧模式
    pub fn authenticate(&mut self) {
        self.authenticated = true;
    }

    fn scan(&self, buf: &[u8]) -> FrameScan {
        match self.method {
            FrameMethod::Meter => scan_frame(buf),
            FrameMethod::Rtu => scan_rtu_frame(buf),
        }
    }
}

impl Decoder for SessionCodec {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        if !self.authenticated {
            return Ok(Some(Inbound::Token(buf.split().freeze())));
        }

        loop {
            match self.scan(buf) {
                FrameScan::Incomplete => {
                    if buf.len() > MAX_BUFFER {
                        debug!(target: "ems.session", len = buf.len(), "frame_buffer_overflow");
                        buf.clear();
                    }
                    return Ok(None);
                }
                FrameScan::Discard(count) => {
                    debug!(target: "ems.session", count, "frame_bytes_discarded");
                    let _ = buf.split_to(count.min(buf.len()));
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                FrameScan::Frame(len) => return Ok(Some(Inbound::Frame(buf.split_to(len).freeze()))),
            }
        }
    }
}

impl Encoder<Bytes> for SessionCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ems_codec::crc16_modbus;
    use ems_codec::meter::{FRAME_PREAMBLE, FieldName, MeterFrame};

    fn meter_frame() -> Vec<u8> {
        MeterFrame::new(0x10, vec![0xAA; 7], 0x81)
            .with_field(FieldName::DataId, [0x0A, 0x81])
            .with_field(FieldName::Seq, [0x01])
            .encode()
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_first_chunk_is_token() {
        let mut codec = SessionCodec::new(FrameMethod::Meter);
        let mut buf = BytesMut::from(&b"token-a"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Token(Bytes::from_static(b"token-a")))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_meter_frames_split_across_reads() {
        let mut codec = SessionCodec::new(FrameMethod::Meter);
        codec.authenticate();
        let frame = meter_frame();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[FRAME_PREAMBLE, FRAME_PREAMBLE]);
        buf.extend_from_slice(&frame[..5]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&frame[5..]);
        buf.extend_from_slice(&frame);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Frame(Bytes::from(frame.clone())))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Frame(Bytes::from(frame)))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rtu_frames() {
        let mut codec = SessionCodec::new(FrameMethod::Rtu);
        codec.authenticate();
        let mut frame = vec![0x01, 0x03, 0x02, 0x00, 0x2A];
        let crc = crc16_modbus(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Frame(Bytes::from(frame)))
        );
    }

    #[test]
    fn test_noise_is_dropped() {
        let mut codec = SessionCodec::new(FrameMethod::Meter);
        codec.authenticate();
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x02][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }
}
