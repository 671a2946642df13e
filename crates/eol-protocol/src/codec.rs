//! 信号位域编解码
//!
//! 负责把信号的原始整数值从帧负载中取出/写入，以及物理值与原始值之间的换算。

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// 信号位序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel 位序，`start_bit` 为最低位
    #[default]
    LittleEndian,
    /// Motorola 位序，`start_bit` 为最高位（DBC 锯齿编号）
    BigEndian,
}

/// 位号列表，按数值从低位到高位排列
pub type BitPositions = SmallVec<[u16; 64]>;

/// 计算信号在负载中占用的位号（按数值从低位到高位）
///
/// 位号 `b` 对应字节 `b / 8` 中的第 `b % 8` 位（0 为字节最低位）。
/// 超出 `u16` 的位号饱和为 `u16::MAX`，由 [`fits_in`] 拒绝。
pub fn bit_positions(start_bit: u16, length: u16, order: ByteOrder) -> BitPositions {
    let mut positions = BitPositions::new();
    match order {
        ByteOrder::LittleEndian => {
            for i in 0..length {
                positions.push(start_bit.saturating_add(i));
            }
        },
        ByteOrder::BigEndian => {
            // 从最高位开始沿锯齿顺序展开，最后反转为低位在前
            let mut pos = start_bit;
            for i in 0..length {
                positions.push(pos);
                if i + 1 == length {
                    break;
                }
                if pos % 8 == 0 {
                    pos = pos.saturating_add(15);
                } else {
                    pos -= 1;
                }
            }
            positions.reverse();
        },
    }
    positions
}

/// 检查信号位域是否完全落在 `payload_len` 字节之内
pub fn fits_in(start_bit: u16, length: u16, order: ByteOrder, payload_len: usize) -> bool {
    if length == 0 || length > 64 {
        return false;
    }
    let limit = payload_len.saturating_mul(8).min(u16::MAX as usize);
    if start_bit as usize >= limit {
        return false;
    }
    bit_positions(start_bit, length, order)
        .iter()
        .all(|&p| (p as usize) < limit)
}

/// 从负载中提取原始无符号值
///
/// 调用方需保证位域落在负载之内（见 [`fits_in`]）。
pub fn extract_bits(data: &[u8], start_bit: u16, length: u16, order: ByteOrder) -> u64 {
    let mut value = 0u64;
    for (i, &pos) in bit_positions(start_bit, length, order).iter().enumerate() {
        let byte = data[(pos / 8) as usize];
        if (byte >> (pos % 8)) & 1 == 1 {
            value |= 1u64 << i;
        }
    }
    value
}

/// 把原始无符号值写入负载（覆盖位域内的旧值）
pub fn insert_bits(data: &mut [u8], start_bit: u16, length: u16, order: ByteOrder, raw: u64) {
    for (i, &pos) in bit_positions(start_bit, length, order).iter().enumerate() {
        let byte = &mut data[(pos / 8) as usize];
        let mask = 1u8 << (pos % 8);
        if (raw >> i) & 1 == 1 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

/// 有符号扩展（二进制补码）
pub fn sign_extend(raw: u64, length: u16) -> i64 {
    if length >= 64 {
        return raw as i64;
    }
    let sign_bit = 1u64 << (length - 1);
    if raw & sign_bit != 0 {
        (raw | !((1u64 << length) - 1)) as i64
    } else {
        raw as i64
    }
}

/// 位域可表示的原始值范围
pub fn raw_bounds(length: u16, signed: bool) -> (i128, i128) {
    let length = length.min(64) as u32;
    if signed {
        let half = 1i128 << (length - 1);
        (-half, half - 1)
    } else {
        (0, (1i128 << length) - 1)
    }
}

/// 原始值截断为位域宽度（负数取补码）
pub fn truncate_raw(raw: i64, length: u16) -> u64 {
    if length >= 64 {
        raw as u64
    } else {
        (raw as u64) & ((1u64 << length) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_positions() {
        let positions = bit_positions(4, 8, ByteOrder::LittleEndian);
        assert_eq!(positions.as_slice(), &[4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_big_endian_positions_cross_byte() {
        // Motorola: start_bit 7 (byte 0 MSB), 16 位 → byte0 全部 + byte1 全部
        let positions = bit_positions(7, 16, ByteOrder::BigEndian);
        assert_eq!(positions[0], 8); // 最低位在 byte1 bit0
        assert_eq!(positions[15], 7); // 最高位在 byte0 bit7
    }

    #[test]
    fn test_extract_little_endian_u16() {
        let data = [0x34, 0x12, 0, 0, 0, 0, 0, 0];
        assert_eq!(extract_bits(&data, 0, 16, ByteOrder::LittleEndian), 0x1234);
    }

    #[test]
    fn test_extract_big_endian_u16() {
        let data = [0x12, 0x34, 0, 0, 0, 0, 0, 0];
        assert_eq!(extract_bits(&data, 7, 16, ByteOrder::BigEndian), 0x1234);
    }

    #[test]
    fn test_insert_then_extract_keeps_neighbours() {
        let mut data = [0xFFu8; 8];
        insert_bits(&mut data, 4, 6, ByteOrder::LittleEndian, 0b10_1010);
        assert_eq!(extract_bits(&data, 4, 6, ByteOrder::LittleEndian), 0b10_1010);
        // 位域外的位保持不变
        assert_eq!(data[0] & 0x0F, 0x0F);
        assert_eq!(data[1] & 0xFC, 0xFC);
    }

    #[test]
    fn test_insert_big_endian() {
        let mut data = [0u8; 8];
        insert_bits(&mut data, 7, 16, ByteOrder::BigEndian, 0xBEEF);
        assert_eq!(&data[..2], &[0xBE, 0xEF]);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xFF, 8), -1);
        assert_eq!(sign_extend(0x7F, 8), 127);
        assert_eq!(sign_extend(0b100, 3), -4);
        assert_eq!(sign_extend(u64::MAX, 64), -1);
    }

    #[test]
    fn test_fits_in() {
        assert!(fits_in(0, 64, ByteOrder::LittleEndian, 8));
        assert!(!fits_in(1, 64, ByteOrder::LittleEndian, 8));
        assert!(fits_in(7, 16, ByteOrder::BigEndian, 2));
        assert!(!fits_in(7, 16, ByteOrder::BigEndian, 1));
        assert!(!fits_in(0, 0, ByteOrder::LittleEndian, 8));
    }

    #[test]
    fn test_fits_in_rejects_huge_start_bit() {
        assert!(!fits_in(u16::MAX, 2, ByteOrder::LittleEndian, 8));
        assert!(!fits_in(u16::MAX - 3, 16, ByteOrder::BigEndian, 8));
        assert!(!fits_in(u16::MAX - 1, 8, ByteOrder::LittleEndian, usize::MAX));
        // 展开本身也不会溢出
        let positions = bit_positions(u16::MAX - 1, 4, ByteOrder::LittleEndian);
        assert_eq!(positions.as_slice(), &[u16::MAX - 1, u16::MAX, u16::MAX, u16::MAX]);
        assert_eq!(bit_positions(u16::MAX - 7, 9, ByteOrder::BigEndian).len(), 9);
    }

    #[test]
    fn test_raw_bounds() {
        assert_eq!(raw_bounds(8, false), (0, 255));
        assert_eq!(raw_bounds(8, true), (-128, 127));
        assert_eq!(raw_bounds(1, false), (0, 1));
    }

    #[test]
    fn test_truncate_raw_negative() {
        assert_eq!(truncate_raw(-1, 4), 0x0F);
        assert_eq!(truncate_raw(5, 4), 5);
    }
}
