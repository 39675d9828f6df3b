//! 송신자 (서버측)
//!
//! - 수신자 하나의 연결을 기다린 뒤 요청이 오면 전체 청크를 배치로 전송
//! - NACK이 오면 누락 청크만 재전송 배치로 전송
//! - 완료 패킷을 받으면 종료

use std::net::SocketAddr;

use rand::seq::SliceRandom;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::chunk::MessageChunker;
use crate::loss::{self, DropPolicy};
use crate::message::{mark_batch_end, Control};
use crate::packet::{Packet, SequenceNum};
use crate::session::{
    Outcome, Role, SessionController, SessionLink, SessionState, TransferHandle,
};
use crate::stats::TransferStats;
use crate::transport::{PacketReader, PacketWriter};
use crate::{Config, Error, Result};

/// 송신자
pub struct Sender {
    /// 설정
    config: Config,

    /// 연결 대기 소켓
    listener: TcpListener,

    /// 전송할 청크들
    chunker: MessageChunker,

    /// 손실 시뮬레이션
    drop_policy: Box<dyn DropPolicy>,

    /// 상태 발행
    link: SessionLink,
}

impl Sender {
    /// 주소에 바인딩하고 메시지를 청크로 분할
    ///
    /// 포트 0으로 바인딩한 뒤 `local_addr()`로 실제 포트를 알 수 있음
    pub async fn bind(
        config: Config,
        bind_addr: SocketAddr,
        message: impl AsRef<str>,
    ) -> Result<Self> {
        config.validate()?;

        let chunker = MessageChunker::new(message.as_ref(), config.chunk_size, &Packet::new())?;
        let listener = TcpListener::bind(bind_addr).await?;
        let drop_policy = loss::from_config(&config);

        let link = SessionLink::new(Role::Sender);
        let total = chunker.total_packets();
        link.update_stats(|stats| stats.total_packets = total);

        info!(
            "CMTP Sender bound on {} ({} chars, {} packets)",
            listener.local_addr()?,
            message.as_ref().chars().count(),
            total
        );

        Ok(Self {
            config,
            listener,
            chunker,
            drop_policy,
            link,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 드롭 정책 교체 (테스트용)
    pub fn with_drop_policy(mut self, policy: impl DropPolicy + 'static) -> Self {
        self.drop_policy = Box::new(policy);
        self
    }

    pub fn controller(&self) -> SessionController {
        self.link.controller()
    }

    pub fn state(&self) -> SessionState {
        self.link.state()
    }

    /// 전용 태스크에서 실행
    pub fn spawn(self) -> TransferHandle<TransferStats> {
        let controller = self.controller();
        TransferHandle::spawn(controller, self.run())
    }

    /// 세션 실행, 모든 실패는 종료 결과로 변환
    pub async fn run(mut self) -> Outcome<TransferStats> {
        match self.exchange().await {
            Ok(()) => {
                self.link.enter(SessionState::Done);
                self.link.publish("Message sent successfully", 1.0);

                let stats = self.link.stats_snapshot();
                info!("SERVER - 전송 완료: {}", stats.summary());
                Outcome::Completed(stats)
            }
            Err(e) => self.link.terminate(e),
        }
    }

    async fn exchange(&mut self) -> Result<()> {
        let stream = self.accept().await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = PacketReader::new(read_half, self.config.max_packet_len);
        let mut writer = PacketWriter::new(write_half);

        let total = self.chunker.total_packets();
        let mut requested = false;
        let mut acknowledged: u32 = 0;

        loop {
            let packet = match reader.next_packet(self.link.cancel_token()).await? {
                Some(packet) => packet,
                None => return Err(Error::ConnectionLost),
            };

            let control = match Control::interpret(&packet) {
                Ok(control) => control,
                Err(e) => {
                    warn!("SERVER - 제어 패킷 해석 실패, 건너뜀: {}", e);
                    self.link.update_stats(|stats| stats.malformed_packets += 1);
                    continue;
                }
            };

            match control {
                Control::MessageRequest => {
                    if requested {
                        warn!("SERVER - 중복 메시지 요청, 전체 재전송");
                    }
                    requested = true;
                    info!("SERVER - 메시지 요청 수신, {} 패킷 전송", total);

                    self.link.enter(SessionState::Sending);
                    let candidates = self.chunker.sequence_numbers();
                    self.transmit_batch(&mut writer, candidates, false, acknowledged)
                        .await?;
                    self.link.enter(SessionState::AwaitingAck);
                }
                Control::Retransmit(missing) if requested => {
                    self.link.update_stats(|stats| stats.nacks_received += 1);
                    acknowledged = total.saturating_sub(missing.len() as u32);

                    let candidates = self.valid_indices(missing);
                    if candidates.is_empty() {
                        warn!("SERVER - 재전송 후보 없음, 다음 패킷 대기");
                        continue;
                    }

                    debug!("SERVER - 재전송 요청: {:?}", candidates);
                    self.link.enter(SessionState::Retransmitting);
                    self.transmit_batch(&mut writer, candidates, true, acknowledged)
                        .await?;
                    self.link.enter(SessionState::AwaitingAck);
                }
                Control::Completed if requested => {
                    acknowledged = total;
                    let status = self
                        .link
                        .update_stats(|stats| stats.sender_status(acknowledged));
                    self.link.publish(status, 1.0);
                    info!("SERVER - 수신자 완료 확인");
                    return Ok(());
                }
                Control::Unknown => {
                    warn!("SERVER - 알 수 없는 패킷 무시: {:?}", packet.packet_string());
                }
                other => {
                    warn!("SERVER - 요청 전 제어 패킷 무시: {:?}", other);
                }
            }
        }
    }

    /// 연결 하나 대기 (취소/타임아웃)
    async fn accept(&self) -> Result<TcpStream> {
        let timeout = self.config.accept_timeout();
        self.link.set_status(format!(
            "Waiting for client connection on {}",
            self.local_addr()?
        ));

        tokio::select! {
            biased;
            _ = self.link.cancel_token().cancelled() => Err(Error::Cancelled),
            accepted = tokio::time::timeout(timeout, self.listener.accept()) => match accepted {
                Ok(Ok((stream, peer))) => {
                    stream.set_nodelay(true)?;
                    info!("SERVER - 클라이언트 연결: {}", peer);
                    self.link.set_status(format!("Client connected from {peer}"));
                    Ok(stream)
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(Error::ConnectionTimeout {
                    timeout_ms: self.config.accept_timeout_ms,
                }),
            },
        }
    }

    /// 배치 전송
    ///
    /// 마지막 패킷은 드롭하지 않고 COMPLETED=T를 붙인 사본으로 보냄
    async fn transmit_batch(
        &mut self,
        writer: &mut PacketWriter<OwnedWriteHalf>,
        mut candidates: Vec<SequenceNum>,
        retransmission: bool,
        acknowledged: u32,
    ) -> Result<()> {
        if self.config.shuffles_batches() {
            candidates.shuffle(&mut rand::thread_rng());
        }

        let total = self.chunker.total_packets();
        let last = candidates.len().saturating_sub(1);
        self.link.update_stats(|stats| stats.batches += 1);

        for (i, seq) in candidates.into_iter().enumerate() {
            if self.link.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let chunk = match self.chunker.packet(seq) {
                Some(chunk) => chunk,
                None => continue,
            };
            let is_last = i == last;
            let dropped = !is_last && self.drop_policy.should_drop(seq);

            if dropped {
                debug!("SERVER - 패킷 {} 드롭 (시뮬레이션)", seq);
            } else if is_last {
                writer.send(&mark_batch_end(chunk)).await?;
            } else {
                writer.send(chunk).await?;
            }

            let status = self.link.update_stats(|stats| {
                stats.packets_sent += 1;
                if dropped {
                    stats.packets_dropped += 1;
                }
                if retransmission {
                    stats.retransmitted_packets += 1;
                }
                stats.sender_status(acknowledged)
            });
            self.link
                .publish(status, f64::from(acknowledged) / f64::from(total));
        }

        Ok(())
    }

    /// 범위 밖 번호를 걸러낸 재전송 후보
    fn valid_indices(&self, requested: Vec<SequenceNum>) -> Vec<SequenceNum> {
        let total = self.chunker.total_packets();
        requested
            .into_iter()
            .filter(|&seq| {
                let valid = seq < total;
                if !valid {
                    warn!("SERVER - 범위 밖 재전송 요청 무시: {} (total {})", seq, total);
                }
                valid
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_sender(message: &str, chunk_size: usize) -> Sender {
        let config = Config {
            chunk_size,
            ..Config::default()
        };
        Sender::bind(config, "127.0.0.1:0".parse().unwrap(), message)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bind_prepares_chunks() {
        let sender = bind_sender("hello world", 5).await;
        assert_eq!(sender.chunker.total_packets(), 3);
        assert_eq!(sender.controller().stats().total_packets, 3);
        assert_eq!(sender.state(), SessionState::AwaitingConnection);
        assert_ne!(sender.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        let result = Sender::bind(config, "127.0.0.1:0".parse().unwrap(), "x").await;
        assert!(matches!(result, Err(Error::InvalidChunkSize)));
    }

    #[tokio::test]
    async fn test_valid_indices_skips_out_of_range() {
        let sender = bind_sender("0123456789", 1).await;
        assert_eq!(sender.valid_indices(vec![2, 10, 5, 42]), vec![2, 5]);
        assert!(sender.valid_indices(vec![10]).is_empty());
    }
}
