//! 메시지 분할과 조립
//!
//! - MessageChunker: 메시지 본문을 시퀀스 번호가 붙은 청크 패킷들로 분할 (송신측)
//! - MessageAssembler: 수신한 청크를 시퀀스 번호로 모아 원본 메시지 복원 (수신측)

use std::collections::BTreeMap;

use crate::packet::{ArgKey, Packet, PacketDecoder, SequenceNum};
use crate::{Error, Result};

/// 메시지 분할기 (송신측)
#[derive(Debug, Clone)]
pub struct MessageChunker {
    packets: Vec<Packet>,
}

impl MessageChunker {
    /// 본문을 `chunk_size` 문자 단위로 분할
    ///
    /// 모든 청크는 `base`의 인자를 복사한 뒤 `SEQUENCE_NUM`, `TOTAL_PACKETS`를 덧붙임.
    /// 빈 메시지도 최소 1개 패킷을 만듦
    pub fn new(body: &str, chunk_size: usize, base: &Packet) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidChunkSize);
        }

        let slices = split_chars(body, chunk_size);
        let total = slices.len().to_string();

        let packets = slices
            .into_iter()
            .enumerate()
            .map(|(seq, slice)| {
                let mut packet = base.clone();
                packet
                    .set_arg(ArgKey::SequenceNum, seq.to_string())
                    .set_arg(ArgKey::TotalPackets, total.as_str())
                    .set_body(slice);
                packet
            })
            .collect();

        Ok(Self { packets })
    }

    /// 총 패킷 수
    pub fn total_packets(&self) -> u32 {
        self.packets.len() as u32
    }

    /// 시퀀스 번호로 패킷 조회 (재전송용 임의 접근)
    pub fn packet(&self, seq: SequenceNum) -> Option<&Packet> {
        self.packets.get(seq as usize)
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// 모든 시퀀스 번호
    pub fn sequence_numbers(&self) -> Vec<SequenceNum> {
        (0..self.total_packets()).collect()
    }
}

/// 문자 경계에서 자르기
fn split_chars(body: &str, chunk_size: usize) -> Vec<&str> {
    let mut slices = Vec::with_capacity(body.len() / chunk_size + 1);
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in body.char_indices() {
        if count == chunk_size {
            slices.push(&body[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    slices.push(&body[start..]);

    slices
}

/// 메시지 조립기 (수신측)
#[derive(Debug, Default)]
pub struct MessageAssembler {
    /// 시퀀스 번호 -> 본문 조각
    slots: BTreeMap<SequenceNum, String>,

    /// 첫 청크에서 알게 되는 총 패킷 수
    total: Option<u32>,

    /// 가장 최근에 추가한 패킷 (제어 필드 조회용)
    last: Option<PacketDecoder>,

    /// 중복 수신 수
    duplicates: u64,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 청크 패킷 추가
    ///
    /// 새 시퀀스 번호면 `Ok(true)`, 이미 받은 번호면 같은 자리를 덮어쓰고 `Ok(false)`.
    /// 잘못된 청크여도 최근 패킷으로는 기록됨
    pub fn add_packet(&mut self, packet: PacketDecoder) -> Result<bool> {
        let result = self.insert(&packet);
        self.last = Some(packet);
        result
    }

    fn insert(&mut self, packet: &PacketDecoder) -> Result<bool> {
        let total = packet.get_u32_arg(ArgKey::TotalPackets)?;
        let seq = packet.get_u32_arg(ArgKey::SequenceNum)?;

        if total == 0 {
            return Err(Error::malformed("TOTAL_PACKETS가 0"));
        }
        if let Some(expected) = self.total {
            if expected != total {
                return Err(Error::InconsistentTotal {
                    expected,
                    got: total,
                });
            }
        }
        if seq >= total {
            return Err(Error::InvalidSequenceNum { seq, total });
        }

        self.total = Some(total);
        let body = packet.body().unwrap_or_default().to_owned();
        let fresh = self.slots.insert(seq, body).is_none();
        if !fresh {
            self.duplicates += 1;
        }

        Ok(fresh)
    }

    /// 받은 서로 다른 시퀀스 번호 수
    pub fn received_count(&self) -> usize {
        self.slots.len()
    }

    pub fn total_packets(&self) -> Option<u32> {
        self.total
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicates
    }

    /// 수신률 (0.0 ~ 1.0), 첫 청크 전에는 None
    pub fn progress_ratio(&self) -> Option<f64> {
        self.total
            .map(|total| self.slots.len() as f64 / f64::from(total))
    }

    /// 수신률 (%), 첫 청크 전에는 None
    pub fn percent_complete(&self) -> Option<f64> {
        self.progress_ratio().map(|ratio| ratio * 100.0)
    }

    /// 모든 청크 수신 여부
    pub fn received_all(&self) -> bool {
        self.total
            .map_or(false, |total| self.slots.len() == total as usize)
    }

    /// 누락된 시퀀스 번호 (오름차순), 총 개수를 모르면 None
    pub fn missing_sequence_numbers(&self) -> Option<Vec<SequenceNum>> {
        self.total.map(|total| {
            (0..total)
                .filter(|seq| !self.slots.contains_key(seq))
                .collect()
        })
    }

    /// 시퀀스 순서로 이어붙인 원본 메시지
    ///
    /// `trim`이면 끝 공백 제거
    pub fn full_message(&self, trim: bool) -> Result<String> {
        if !self.received_all() {
            return Err(Error::IncompleteMessage {
                received: self.slots.len(),
                total: self.total.unwrap_or(0),
            });
        }

        let message: String = self.slots.values().map(String::as_str).collect();
        if trim {
            Ok(message.trim_end().to_owned())
        } else {
            Ok(message)
        }
    }

    /// 최근 패킷의 인자 존재 여부
    pub fn contains_arg(&self, key: ArgKey) -> bool {
        self.last
            .as_ref()
            .map_or(false, |packet| packet.contains_arg(key))
    }

    /// 최근 패킷의 스칼라 인자
    pub fn get_arg(&self, key: ArgKey) -> Result<&str> {
        match &self.last {
            Some(packet) => packet.get_arg(key),
            None => Err(Error::MissingArg { key }),
        }
    }

    pub fn last_packet(&self) -> Option<&PacketDecoder> {
        self.last.as_ref()
    }
}
