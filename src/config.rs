//! 프로토콜 설정

use std::time::Duration;

use crate::{
    Error, Result, DEFAULT_ACCEPT_TIMEOUT_MS, DEFAULT_CHUNK_SIZE, DEFAULT_DROP_PROBABILITY,
    MAX_PACKET_LEN,
};

/// CMTP 세션 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크당 최대 문자 수
    pub chunk_size: usize,

    /// 송신측 연결 대기 타임아웃 (밀리초)
    pub accept_timeout_ms: u64,

    /// 수신측 연결 타임아웃 (밀리초)
    pub connect_timeout_ms: u64,

    /// 패킷 손실 시뮬레이션 (송신측 전용)
    pub simulate_packet_loss: bool,

    /// 손실 시뮬레이션 시 패킷별 드롭 확률 (0.0 ~ 1.0 미만)
    pub packet_drop_probability: f64,

    /// 배치 전송 순서 무작위화
    pub shuffle_batches: bool,

    /// 손실 시뮬레이션 시드 (None이면 OS 엔트로피)
    pub loss_seed: Option<u64>,

    /// 재조립 시 끝 공백 제거 (기본은 보낸 그대로)
    pub trim_message: bool,

    /// 디코더가 허용하는 최대 페이로드 길이 (바이트)
    pub max_packet_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT_MS,
            connect_timeout_ms: 10_000,
            simulate_packet_loss: false,
            packet_drop_probability: DEFAULT_DROP_PROBABILITY,
            shuffle_batches: false,
            loss_seed: None,
            trim_message: false,
            max_packet_len: MAX_PACKET_LEN,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 데모용 설정: 20% 손실 시뮬레이션 + 순서 무작위화
    pub fn demo() -> Self {
        Self {
            simulate_packet_loss: true,
            packet_drop_probability: DEFAULT_DROP_PROBABILITY,
            shuffle_batches: true,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크 흉내용 설정
    pub fn unstable_network() -> Self {
        Self {
            chunk_size: 256,                  // 작은 청크
            accept_timeout_ms: 120_000,
            connect_timeout_ms: 30_000,
            simulate_packet_loss: true,
            packet_drop_probability: 0.45,
            shuffle_batches: true,
            ..Self::default()
        }
    }

    /// 배치 순서를 섞을지 (손실 시뮬레이션 중에는 항상 섞음)
    pub fn shuffles_batches(&self) -> bool {
        self.shuffle_batches || self.simulate_packet_loss
    }

    /// 연결 대기 타임아웃
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// 연결 타임아웃
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidChunkSize);
        }
        if self.max_packet_len == 0 {
            return Err(Error::InvalidConfig("max_packet_len must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.packet_drop_probability) {
            return Err(Error::InvalidConfig(format!(
                "packet_drop_probability {} not in [0, 1)",
                self.packet_drop_probability
            )));
        }
        Ok(())
    }
}
