//! RTCM 数据解析模块
//! RTCM3 帧同步、CRC-24Q 校验、消息类型与 MSM 头解析

use super::error::DecodeError;
use super::satellite::Constellation;

/// RTCM3 帧前导字节
pub const PREAMBLE: u8 = 0xD3;
/// 帧头长度 (前导 + 6 位保留 + 10 位长度)
const HEADER_LEN: usize = 3;
/// CRC-24Q 长度
const CRC_LEN: usize = 3;

/// MSM 头固定部分位数 (消息号之后直到信号掩码结束)
const MSM_FIXED_HEADER_BITS: usize = 12 + 12 + 30 + 1 + 3 + 7 + 2 + 2 + 1 + 3 + 64 + 32;
/// 单元掩码最大位数
const MSM_MAX_CELLS: usize = 64;

/// 解码后的单条 RTCM 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// 消息类型 (12 位)
    pub msg_type: u16,
    /// 负载长度 (字节)
    pub payload_len: usize,
    /// MSM 头，仅 MSM1..MSM7 消息存在
    pub msm: Option<MsmHeader>,
}

impl DecodedMessage {
    /// 消息标识，统计以此为键
    pub fn identity(&self) -> String {
        self.msg_type.to_string()
    }
}

/// MSM 消息头
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsmHeader {
    /// 参考站 ID
    pub station_id: u16,
    /// 卫星数 (卫星掩码置位数)
    pub satellite_count: usize,
    /// 按帧内顺序排列的卫星 PRN
    pub prns: Vec<u8>,
    /// 卫星掩码，bit i-1 置位表示 PRN i
    pub satellite_mask: u64,
    /// 信号掩码，bit id-1 置位表示信号 id
    pub signal_mask: u32,
    /// 单元掩码位数 (卫星数 × 信号数)
    pub cell_count: usize,
}

/// 一次解码的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOutput {
    /// 按顺序解出的消息
    pub messages: Vec<DecodedMessage>,
    /// 已消费的字节数，末尾不完整帧不计入
    pub consumed: usize,
    /// CRC 校验失败次数
    pub crc_failures: usize,
    /// 帧体解析错误，出现后本轮解码终止
    pub error: Option<DecodeError>,
}

/// RTCM3 解码器，无状态
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcmDecoder;

impl RtcmDecoder {
    /// 创建新的 RTCM 解码器
    pub fn new() -> Self {
        Self
    }

    /// 解码字节快照
    ///
    /// 非前导字节、保留位非零的伪帧头以及 CRC 错误的帧都会被跳过并计入
    /// `consumed`；尾部不完整的帧保留给下一次解码。遇到通过 CRC 但帧体
    /// 损坏的 MSM 消息时，该帧被消费但不上报，并在 `error` 中返回。
    pub fn decode(&self, data: &[u8]) -> DecodeOutput {
        let mut out = DecodeOutput::default();
        let mut pos = 0;

        while pos < data.len() {
            if data[pos] != PREAMBLE {
                pos += 1;
                continue;
            }

            let remaining = &data[pos..];
            if remaining.len() < HEADER_LEN {
                break;
            }
            if remaining[1] & 0xFC != 0 {
                pos += 1;
                continue;
            }

            let length = (((remaining[1] & 0x03) as usize) << 8) | remaining[2] as usize;
            let total = HEADER_LEN + length + CRC_LEN;
            if remaining.len() < total {
                break;
            }

            let body_end = HEADER_LEN + length;
            let expected = ((remaining[body_end] as u32) << 16)
                | ((remaining[body_end + 1] as u32) << 8)
                | remaining[body_end + 2] as u32;
            if crc24q(&remaining[..body_end]) != expected {
                out.crc_failures += 1;
                pos += 1;
                continue;
            }

            let payload = &remaining[HEADER_LEN..body_end];
            pos += total;

            if payload.len() < 2 {
                continue;
            }
            let msg_type = ((payload[0] as u16) << 4) | ((payload[1] as u16) >> 4);
            if msg_type == 0 {
                continue;
            }

            let msm = if is_msm(msg_type) {
                match parse_msm_header(msg_type, payload) {
                    Ok(header) => Some(header),
                    Err(e) => {
                        out.error = Some(e);
                        break;
                    }
                }
            } else {
                None
            };

            out.messages.push(DecodedMessage {
                msg_type,
                payload_len: payload.len(),
                msm,
            });
        }

        out.consumed = pos;
        out
    }
}

/// 是否为 MSM1..MSM7 消息
pub fn is_msm(msg_type: u16) -> bool {
    (1071..=1127).contains(&msg_type) && (msg_type - 1071) % 10 <= 6
}

fn parse_msm_header(msg_type: u16, payload: &[u8]) -> Result<MsmHeader, DecodeError> {
    let available = payload.len() * 8;
    if available < MSM_FIXED_HEADER_BITS {
        return Err(DecodeError::Truncated {
            msg_type,
            needed: MSM_FIXED_HEADER_BITS,
            available,
        });
    }

    let mut bits = BitReader::new(payload);
    bits.skip(12);
    let station_id = bits.read(12) as u16;
    // 历元时间、多消息标志、IODS、保留位、时钟校正、平滑相关字段
    bits.skip(30 + 1 + 3 + 7 + 2 + 2 + 1 + 3);
    let wire_sat_mask = bits.read(64);
    let wire_sig_mask = bits.read(32) as u32;

    let satellite_count = wire_sat_mask.count_ones() as usize;
    let cell_count = satellite_count * wire_sig_mask.count_ones() as usize;
    if cell_count > MSM_MAX_CELLS {
        return Err(DecodeError::CellMaskTooLarge {
            msg_type,
            cells: cell_count,
        });
    }
    let needed = MSM_FIXED_HEADER_BITS + cell_count;
    if available < needed {
        return Err(DecodeError::Truncated {
            msg_type,
            needed,
            available,
        });
    }

    // 线上顺序为最高位对应 1 号卫星/信号
    let prns = (1..=64u8)
        .filter(|prn| wire_sat_mask & (1u64 << (64 - *prn as u32)) != 0)
        .collect();

    Ok(MsmHeader {
        station_id,
        satellite_count,
        prns,
        satellite_mask: wire_sat_mask.reverse_bits(),
        signal_mask: wire_sig_mask.reverse_bits(),
        cell_count,
    })
}

/// 按位读取大端比特流，调用方保证长度足够
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn skip(&mut self, bits: usize) {
        self.pos += bits;
    }

    fn read(&mut self, bits: usize) -> u64 {
        let mut value = 0u64;
        for _ in 0..bits {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            value = (value << 1) | bit as u64;
            self.pos += 1;
        }
        value
    }
}

const CRC24Q_POLY: u32 = 0x0186_4CFB;

const CRC24Q_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 16;
        let mut bit = 0;
        while bit < 8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24Q_POLY;
            }
            bit += 1;
        }
        table[i] = crc & 0x00FF_FFFF;
        i += 1;
    }
    table
};

/// 计算 CRC-24Q
pub fn crc24q(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &b| {
        let idx = (((crc >> 16) ^ b as u32) & 0xFF) as usize;
        ((crc << 8) ^ CRC24Q_TABLE[idx]) & 0x00FF_FFFF
    })
}

/// RTCM 消息类型描述
pub fn describe(msg_type: u16) -> String {
    if is_msm(msg_type) {
        let level = (msg_type - 1071) % 10 + 1;
        let constellation = Constellation::from_msm_type(msg_type)
            .map(|c| c.to_string())
            .unwrap_or_default();
        let content = match level {
            1 => "Compact pseudoranges",
            2 => "Compact phase ranges",
            3 => "Compact pseudoranges and phase ranges",
            4 => "Full pseudoranges and phase ranges",
            5 => "Full pseudoranges, phase ranges, phase range rate, and CNR",
            6 => "Full pseudoranges and CNR (high resolution)",
            _ => "Full pseudoranges, phase ranges, phase range rate, and CNR (high resolution)",
        };
        return format!("{} MSM{} - {}", constellation, level, content);
    }

    match msg_type {
        1005 => "Station coordinates (stationary RTK reference station)",
        1006 => "Station coordinates with antenna height",
        1007 => "Antenna descriptor",
        1008 => "Antenna descriptor & serial number",
        1019 => "GPS ephemeris",
        1020 => "GLONASS ephemeris",
        1033 => "Receiver and antenna descriptors",
        1042 => "BeiDou ephemeris",
        1045 => "Galileo F/NAV ephemeris",
        1046 => "Galileo I/NAV ephemeris",
        1230 => "GLONASS code-phase biases",
        _ => "RTCM correction data",
    }
    .to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 测试用比特写入器
    #[derive(Default)]
    pub(crate) struct BitWriter {
        bytes: Vec<u8>,
        bits: usize,
    }

    impl BitWriter {
        pub(crate) fn put(&mut self, value: u64, width: usize) {
            for i in (0..width).rev() {
                if self.bits % 8 == 0 {
                    self.bytes.push(0);
                }
                let bit = ((value >> i) & 1) as u8;
                let last = self.bytes.len() - 1;
                self.bytes[last] |= bit << (7 - (self.bits % 8));
                self.bits += 1;
            }
        }

        pub(crate) fn finish(self) -> Vec<u8> {
            self.bytes
        }
    }

    /// 为负载加上帧头和 CRC
    pub(crate) fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![PREAMBLE, ((payload.len() >> 8) & 0x03) as u8, payload.len() as u8];
        out.extend_from_slice(payload);
        let crc = crc24q(&out);
        out.extend_from_slice(&[(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]);
        out
    }

    /// 只有消息号的简单帧
    pub(crate) fn plain_frame(msg_type: u16, extra: usize) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.put(msg_type as u64, 12);
        w.put(0, 4);
        for _ in 0..extra {
            w.put(0xAB, 8);
        }
        frame(&w.finish())
    }

    /// 构建 MSM 帧，PRN 与信号 ID 均从 1 开始
    pub(crate) fn msm_frame(msg_type: u16, prns: &[u8], signals: &[u8]) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.put(msg_type as u64, 12);
        w.put(42, 12);
        w.put(123_456, 30);
        w.put(0, 1 + 3 + 7 + 2 + 2 + 1 + 3);
        let sat_mask = prns.iter().fold(0u64, |m, p| m | 1u64 << (64 - *p as u32));
        let sig_mask = signals.iter().fold(0u64, |m, s| m | 1u64 << (32 - *s as u32));
        w.put(sat_mask, 64);
        w.put(sig_mask, 32);
        w.put(u64::MAX, prns.len() * signals.len());
        // 卫星数据占位
        w.put(0, 16);
        frame(&w.finish())
    }

    #[test]
    fn crc24q_known_vector() {
        // RTCM 1005 示例帧 (RTKLIB 测试数据)
        let frame = [
            0xD3, 0x00, 0x13, 0x3E, 0xD7, 0xD3, 0x02, 0x02, 0x98, 0x0E, 0xDE, 0xEF, 0x34, 0xB4,
            0xBD, 0x62, 0xAC, 0x09, 0x41, 0x98, 0x6F, 0x33,
        ];
        assert_eq!(crc24q(&frame), 0x360B98);
        assert_eq!(crc24q(&[]), 0);
    }

    #[test]
    fn decodes_plain_frames_in_order() {
        let mut data = plain_frame(1005, 17);
        data.extend(plain_frame(1033, 4));
        let out = RtcmDecoder::new().decode(&data);

        let types: Vec<u16> = out.messages.iter().map(|m| m.msg_type).collect();
        assert_eq!(types, vec![1005, 1033]);
        assert_eq!(out.messages[0].payload_len, 19);
        assert_eq!(out.messages[0].identity(), "1005");
        assert_eq!(out.consumed, data.len());
        assert!(out.error.is_none());
    }

    #[test]
    fn incomplete_tail_is_not_consumed() {
        let first = plain_frame(1005, 17);
        let second = plain_frame(1006, 19);
        let mut data = first.clone();
        data.extend_from_slice(&second[..second.len() - 2]);

        let out = RtcmDecoder::new().decode(&data);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.consumed, first.len());
    }

    #[test]
    fn garbage_and_bad_crc_are_skipped() {
        let mut corrupt = plain_frame(1019, 10);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        let mut data = vec![0x00, 0x11, 0x22];
        data.extend(corrupt);
        data.extend(plain_frame(1033, 3));

        let out = RtcmDecoder::new().decode(&data);
        assert_eq!(out.crc_failures, 1);
        assert_eq!(out.consumed, data.len());
        assert_eq!(out.messages.iter().map(|m| m.msg_type).collect::<Vec<_>>(), vec![1033]);
        assert!(out.error.is_none());
    }

    #[test]
    fn frame_without_type_code_consumed_silently() {
        let data = frame(&[0x12]);
        let out = RtcmDecoder::new().decode(&data);
        assert!(out.messages.is_empty());
        assert_eq!(out.consumed, data.len());
    }

    #[test]
    fn msm_header_fields() {
        let data = msm_frame(1074, &[4, 9, 17], &[2, 15]);
        let out = RtcmDecoder::new().decode(&data);
        assert!(out.error.is_none());

        let msm = out.messages[0].msm.as_ref().expect("msm header");
        assert_eq!(msm.station_id, 42);
        assert_eq!(msm.satellite_count, 3);
        assert_eq!(msm.prns, vec![4, 9, 17]);
        assert_eq!(msm.satellite_mask, (1 << 3) | (1 << 8) | (1 << 16));
        assert_eq!(msm.signal_mask, (1 << 1) | (1 << 14));
        assert_eq!(msm.cell_count, 6);
    }

    #[test]
    fn truncated_msm_reports_error_and_stops() {
        let mut w = BitWriter::default();
        w.put(1077, 12);
        w.put(0, 20);
        let bad = frame(&w.finish());
        let mut data = bad.clone();
        data.extend(plain_frame(1005, 17));

        let out = RtcmDecoder::new().decode(&data);
        assert!(matches!(out.error, Some(DecodeError::Truncated { msg_type: 1077, .. })));
        assert!(out.messages.is_empty());
        assert_eq!(out.consumed, bad.len());

        // 解码结果可整体复制，错误随之保留
        let copy = out.clone();
        assert_eq!(copy.error, out.error);
        assert_eq!(copy.consumed, out.consumed);

        let rest = RtcmDecoder::new().decode(&data[out.consumed..]);
        assert_eq!(rest.messages[0].msg_type, 1005);
    }

    #[test]
    fn chunking_does_not_change_decoded_identities() {
        let mut stream = vec![0x42, PREAMBLE];
        stream.extend(plain_frame(1005, 17));
        stream.extend(msm_frame(1084, &[1, 3], &[1, 3]));
        stream.extend(vec![0xFF; 5]);
        stream.extend(msm_frame(1124, &[7, 20, 33], &[1]));
        stream.extend(plain_frame(1230, 6));

        let decoder = RtcmDecoder::new();
        let mut whole: Vec<u16> = decoder.decode(&stream).messages.iter().map(|m| m.msg_type).collect();

        for chunk_size in [1usize, 2, 3, 7, 64] {
            let mut pending: Vec<u8> = Vec::new();
            let mut seen = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                pending.extend_from_slice(chunk);
                let out = decoder.decode(&pending);
                seen.extend(out.messages.iter().map(|m| m.msg_type));
                pending.drain(..out.consumed);
            }
            seen.sort_unstable();
            whole.sort_unstable();
            assert_eq!(seen, whole, "chunk size {chunk_size}");
        }
        assert_eq!(whole, vec![1005, 1084, 1124, 1230]);
    }

    #[test]
    fn descriptions() {
        assert_eq!(describe(1074), "GPS MSM4 - Full pseudoranges and phase ranges");
        assert_eq!(describe(1127).split(" - ").next(), Some("BeiDou MSM7"));
        assert_eq!(describe(1005), "Station coordinates (stationary RTK reference station)");
        assert_eq!(describe(4094), "RTCM correction data");
        assert!(!is_msm(1078));
        assert!(is_msm(1101));
    }
}
