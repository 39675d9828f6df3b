//! 제어 패킷 정의
//!
//! 청크 외에 오가는 패킷은 요청, 완료, NACK 세 가지뿐

use tracing::warn;

use crate::chunk::MessageAssembler;
use crate::packet::{ArgKey, Packet, PacketDecoder, SequenceNum};
use crate::Result;

/// 메시지 요청 타입 값
pub const MESSAGE_REQUEST: &str = "MESSAGE";

/// COMPLETED 참
pub const FLAG_TRUE: &str = "T";

/// COMPLETED 거짓
pub const FLAG_FALSE: &str = "F";

/// 메시지 요청 (수신자 → 송신자)
pub fn request_packet() -> Packet {
    Packet::new().with_arg(ArgKey::RequestType, MESSAGE_REQUEST)
}

/// 전체 수신 완료 (수신자 → 송신자)
pub fn completed_packet() -> Packet {
    Packet::new().with_arg(ArgKey::Completed, FLAG_TRUE)
}

/// 누락 청크 재전송 요청 (수신자 → 송신자)
pub fn nack_packet(missing: &[SequenceNum]) -> Packet {
    let mut packet = Packet::new();
    packet
        .set_arg(ArgKey::Completed, FLAG_FALSE)
        .set_arg(ArgKey::TotalPacketsMissing, missing.len().to_string())
        .set_int_array_arg(ArgKey::MissingPacketNums, missing.iter().copied());
    packet
}

/// 배치 마지막 청크 표시 (원본은 그대로 두고 사본에 COMPLETED=T)
pub fn mark_batch_end(chunk: &Packet) -> Packet {
    chunk.clone().with_arg(ArgKey::Completed, FLAG_TRUE)
}

/// 최근 수신 패킷이 배치 끝을 알렸는지
pub fn is_batch_end(assembler: &MessageAssembler) -> bool {
    assembler.contains_arg(ArgKey::Completed)
        && assembler.get_arg(ArgKey::Completed).ok() == Some(FLAG_TRUE)
}

/// 송신자가 받은 제어 패킷 해석 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// 최초 메시지 요청
    MessageRequest,

    /// 누락 청크 재전송 요청
    Retransmit(Vec<SequenceNum>),

    /// 수신자가 모든 청크를 받음
    Completed,

    /// 해석 불가
    Unknown,
}

impl Control {
    /// 디코딩된 패킷 해석
    ///
    /// 재전송 목록을 읽을 수 없으면 에러
    pub fn interpret(packet: &PacketDecoder) -> Result<Self> {
        if packet.contains_arg(ArgKey::RequestType)
            && packet.get_arg(ArgKey::RequestType)? == MESSAGE_REQUEST
        {
            return Ok(Control::MessageRequest);
        }

        if !packet.contains_arg(ArgKey::Completed) {
            return Ok(Control::Unknown);
        }

        match packet.get_arg(ArgKey::Completed)? {
            FLAG_FALSE => {
                let missing = packet.get_int_array_arg(ArgKey::MissingPacketNums)?;
                if let Ok(declared) = packet.get_u32_arg(ArgKey::TotalPacketsMissing) {
                    if declared as usize != missing.len() {
                        warn!(
                            "TOTAL_PACKETS_MISSING 불일치: declared={}, listed={}",
                            declared,
                            missing.len()
                        );
                    }
                }
                Ok(Control::Retransmit(missing))
            }
            FLAG_TRUE => Ok(Control::Completed),
            _ => Ok(Control::Unknown),
        }
    }
}
