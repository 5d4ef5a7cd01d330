//! 卫星与信号提取模块
//! 从 MSM 消息中提取各星座的卫星 PRN 与信号名称

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::rtcm::DecodedMessage;

/// GNSS 星座
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Constellation {
    /// GPS (1071-1077)
    Gps,
    /// GLONASS (1081-1087)
    Glonass,
    /// Galileo (1091-1097)
    Galileo,
    /// SBAS (1101-1107)
    Sbas,
    /// QZSS (1111-1117)
    Qzss,
    /// 北斗 (1121-1127)
    BeiDou,
}

impl Constellation {
    /// 全部星座，按 MSM 编号顺序
    pub const ALL: [Constellation; 6] = [
        Constellation::Gps,
        Constellation::Glonass,
        Constellation::Galileo,
        Constellation::Sbas,
        Constellation::Qzss,
        Constellation::BeiDou,
    ];

    /// 由 MSM 消息类型推导星座
    pub fn from_msm_type(msg_type: u16) -> Option<Self> {
        if !(1071..=1127).contains(&msg_type) {
            return None;
        }
        Self::ALL.get(((msg_type - 1071) / 10) as usize).copied()
    }

    /// 信号 ID 到名称的映射表
    fn signal_table(self) -> &'static [(u8, &'static str)] {
        match self {
            Constellation::Gps => &[
                (1, "L1 C/A"),
                (2, "L1 P(Y)"),
                (3, "L1 M"),
                (4, "L2 P(Y)"),
                (5, "L2 C"),
                (6, "L2 M"),
                (7, "L5 I"),
                (8, "L5 Q"),
            ],
            Constellation::Glonass => &[
                (1, "G1 C/A"),
                (2, "G1 P"),
                (3, "G2 C/A"),
                (4, "G2 P"),
                (5, "G3 I"),
                (6, "G3 Q"),
            ],
            Constellation::Galileo => &[
                (1, "E1 C"),
                (2, "E1 A"),
                (3, "E1 B"),
                (4, "E5a I"),
                (5, "E5a Q"),
                (6, "E5b I"),
                (7, "E5b Q"),
                (8, "E6 C"),
            ],
            Constellation::Sbas => &[(1, "L1 C/A"), (7, "L5 I"), (8, "L5 Q")],
            Constellation::Qzss => &[
                (1, "L1 C/A"),
                (2, "L1 S"),
                (4, "L2 C"),
                (5, "L2 L"),
                (7, "L5 I"),
                (8, "L5 Q"),
                (9, "L6 I"),
                (10, "L6 Q"),
            ],
            Constellation::BeiDou => &[
                (1, "B1 I"),
                (2, "B1 Q"),
                (3, "B2 I"),
                (4, "B2 Q"),
                (5, "B3 I"),
                (6, "B3 Q"),
            ],
        }
    }

    /// 信号名称，未知 ID 返回通用标签
    pub fn signal_name(self, signal_id: u8) -> String {
        self.signal_table()
            .iter()
            .find(|(id, _)| *id == signal_id)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| format!("Signal {}", signal_id))
    }

    /// 星座简介
    pub fn description(self) -> &'static str {
        match self {
            Constellation::Gps => "Global Positioning System (USA) - 31 operational satellites providing global coverage with L1, L2, and L5 signals.",
            Constellation::Glonass => "Russian GNSS constellation - 24 satellites providing global coverage with L1 and L2 signals on FDMA frequencies.",
            Constellation::Galileo => "European GNSS constellation - Provides high-precision positioning with E1, E5a, E5b, and E6 signals.",
            Constellation::Sbas => "Satellite-Based Augmentation System - Geostationary satellites providing correction data for improved GPS accuracy.",
            Constellation::Qzss => "Quasi-Zenith Satellite System (Japan) - Regional system enhancing GPS in Asia-Oceania with L1, L2, and L5 signals.",
            Constellation::BeiDou => "Chinese Navigation Satellite System - Global coverage with B1, B2, and B3 signals from MEO, IGSO, and GEO satellites.",
        }
    }
}

impl fmt::Display for Constellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constellation::Gps => write!(f, "GPS"),
            Constellation::Glonass => write!(f, "GLONASS"),
            Constellation::Galileo => write!(f, "Galileo"),
            Constellation::Sbas => write!(f, "SBAS"),
            Constellation::Qzss => write!(f, "QZSS"),
            Constellation::BeiDou => write!(f, "BeiDou"),
        }
    }
}

/// 单条 MSM 消息的提取结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// 星座
    pub constellation: Constellation,
    /// 卫星 PRN
    pub satellites: BTreeSet<u8>,
    /// 信号名称
    pub signals: BTreeSet<String>,
}

/// 提取 MSM 消息中的卫星与信号，非 MSM 消息返回 None
pub fn extract(message: &DecodedMessage) -> Option<Extraction> {
    let constellation = Constellation::from_msm_type(message.msg_type)?;
    let msm = message.msm.as_ref()?;

    let mut satellites: BTreeSet<u8> = msm
        .prns
        .iter()
        .take(msm.satellite_count)
        .copied()
        .filter(|prn| *prn > 0)
        .collect();

    // 无 PRN 列表时退回卫星掩码
    if satellites.is_empty() {
        satellites = (1..=64u8)
            .filter(|prn| msm.satellite_mask & (1u64 << (prn - 1)) != 0)
            .collect();
    }

    let signals = (1..=32u8)
        .filter(|id| msm.signal_mask & (1u32 << (id - 1)) != 0)
        .map(|id| constellation.signal_name(id))
        .collect();

    Some(Extraction {
        constellation,
        satellites,
        signals,
    })
}
