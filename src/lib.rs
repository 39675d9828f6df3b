//! # CMTP (Chunked Message Transfer Protocol)
//!
//! TCP 위에서 동작하는 NACK 기반 메시지 청크 전송 프로토콜
//!
//! ## 핵심 특징
//! - **길이 프레이밍**: `LEN:payload` 형식, 본문에 줄바꿈이 있어도 경계 판별
//! - **청크 조립**: 메시지를 시퀀스 번호가 붙은 청크로 분할, 순서 무관 조립
//! - **NACK 재전송**: 배치 끝에서 누락 청크만 다시 요청
//! - **손실 시뮬레이션**: 송신측에 주입 가능한 드롭 정책
//! - **세션 상태 머신**: 역할별 명시적 상태와 감시 가능한 진행률

pub mod chunk;
pub mod config;
pub mod error;
pub mod loss;
pub mod message;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod transport;

pub use chunk::{MessageAssembler, MessageChunker};
pub use config::Config;
pub use error::{Error, Result};
pub use loss::{DropPolicy, NoLoss, RandomLoss};
pub use message::Control;
pub use packet::{ArgKey, ArgValue, Packet, PacketDecoder, SequenceNum};
pub use receiver::Receiver;
pub use sender::Sender;
pub use session::{
    Delivery, Failure, Outcome, Progress, Role, SessionController, SessionState,
    TransferHandle, TransferRequest,
};
pub use stats::TransferStats;

/// 기본 포트
pub const DEFAULT_PORT: u16 = 30121;

/// 기본 청크 크기 (문자)
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// 기본 연결 대기 타임아웃 (밀리초)
pub const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 60_000;

/// 손실 시뮬레이션 기본 드롭 확률
pub const DEFAULT_DROP_PROBABILITY: f64 = 0.2;

/// 최대 페이로드 길이 (바이트)
pub const MAX_PACKET_LEN: usize = 64 * 1024 * 1024; // 64MB
