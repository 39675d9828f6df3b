//! 에러 타입 정의

use thiserror::Error;

use crate::packet::ArgKey;

/// CMTP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("잘못된 패킷: {reason}")]
    MalformedPacket { reason: String },

    #[error("인자 없음: {key}")]
    MissingArg { key: ArgKey },

    #[error("메시지 미완성: {received}/{total} 패킷 수신")]
    IncompleteMessage { received: usize, total: u32 },

    #[error("유효하지 않은 시퀀스 번호: seq={seq}, total={total}")]
    InvalidSequenceNum { seq: u32, total: u32 },

    #[error("총 패킷 수 불일치: expected {expected}, got {got}")]
    InconsistentTotal { expected: u32, got: u32 },

    #[error("청크 크기는 0보다 커야 함")]
    InvalidChunkSize,

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("연결 종료")]
    ConnectionLost,

    #[error("연결 대기 타임아웃: {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    #[error("취소됨")]
    Cancelled,
}

impl Error {
    /// 잘못된 패킷 에러 생성
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket {
            reason: reason.into(),
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
