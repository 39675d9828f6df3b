//! 전송 통계

use std::time::{Duration, Instant};

/// 세션 하나의 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 메시지 총 패킷 수
    pub total_packets: u32,

    /// 전송 시도한 패킷 수 (시뮬레이션 드롭 포함)
    pub packets_sent: u64,

    /// 시뮬레이션으로 드롭한 패킷 수
    pub packets_dropped: u64,

    /// 재전송 배치에서 보낸 패킷 수
    pub retransmitted_packets: u64,

    /// 전송한 배치 수
    pub batches: u64,

    /// 보낸 NACK 수 (수신측)
    pub nacks_sent: u64,

    /// 받은 NACK 수 (송신측)
    pub nacks_received: u64,

    /// 새로 받은 청크 수
    pub packets_received: u64,

    /// 중복 수신 청크 수
    pub duplicate_packets: u64,

    /// 해석 불가 패킷 수
    pub malformed_packets: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_packets: 0,
            packets_sent: 0,
            packets_dropped: 0,
            retransmitted_packets: 0,
            batches: 0,
            nacks_sent: 0,
            nacks_received: 0,
            packets_received: 0,
            duplicate_packets: 0,
            malformed_packets: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 실제로 소켓에 쓴 패킷 수
    pub fn packets_on_wire(&self) -> u64 {
        self.packets_sent.saturating_sub(self.packets_dropped)
    }

    /// 패킷당 한 번을 넘는 전송 비율
    pub fn retransmission_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_sent
            .saturating_sub(u64::from(self.total_packets)) as f64
            / self.packets_sent as f64
    }

    /// 송신측 진행 상태 문자열
    ///
    /// `acknowledged`는 수신자가 이미 받은 것으로 확인된 패킷 수
    pub fn sender_status(&self, acknowledged: u32) -> String {
        let retransmit_percent = if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_sent.saturating_sub(u64::from(acknowledged)) as f64 * 100.0
                / self.packets_sent as f64
        };

        format!(
            "Packets sent: {} - Packets received: {} out of {} total packets...\nPacket retransmissions: {:.0}%",
            self.packets_sent, acknowledged, self.total_packets, retransmit_percent
        )
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Packets: {} | Sent: {} (dropped {}, retransmitted {}) | Received: {} (dup {}, malformed {}) | Batches: {} | NACKs: {} sent / {} received",
            self.elapsed().as_secs_f64(),
            self.total_packets,
            self.packets_sent,
            self.packets_dropped,
            self.retransmitted_packets,
            self.packets_received,
            self.duplicate_packets,
            self.malformed_packets,
            self.batches,
            self.nacks_sent,
            self.nacks_received,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
