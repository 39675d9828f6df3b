//! 수신자 (클라이언트측)
//!
//! - 연결 후 메시지 요청 한 번 전송
//! - 청크를 조립하면서 배치 끝마다 누락분 NACK
//! - 전부 받으면 완료 패킷을 보내고 메시지 반환

use std::net::SocketAddr;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::chunk::MessageAssembler;
use crate::message::{completed_packet, is_batch_end, nack_packet, request_packet};
use crate::packet::Packet;
use crate::session::{
    Outcome, Role, SessionController, SessionLink, SessionState, TransferHandle,
};
use crate::transport::{PacketReader, PacketWriter};
use crate::{Config, Error, Result};

/// 수신자
pub struct Receiver {
    /// 설정
    config: Config,

    /// 송신자 주소
    server_addr: SocketAddr,

    /// 청크 조립기
    assembler: MessageAssembler,

    /// 상태 발행
    link: SessionLink,
}

impl Receiver {
    pub fn new(config: Config, server_addr: SocketAddr) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            server_addr,
            assembler: MessageAssembler::new(),
            link: SessionLink::new(Role::Receiver),
        })
    }

    pub fn controller(&self) -> SessionController {
        self.link.controller()
    }

    pub fn state(&self) -> SessionState {
        self.link.state()
    }

    /// 전용 태스크에서 실행
    pub fn spawn(self) -> TransferHandle<String> {
        let controller = self.controller();
        TransferHandle::spawn(controller, self.run())
    }

    /// 세션 실행, 완료 시 조립된 메시지 반환
    pub async fn run(mut self) -> Outcome<String> {
        match self.exchange().await {
            Ok(message) => {
                self.link.enter(SessionState::Done);
                if message.is_empty() {
                    self.link.publish("Empty message received", 1.0);
                } else {
                    self.link.publish("Message received", 1.0);
                }

                info!(
                    "CLIENT - 수신 완료: {} chars | {}",
                    message.chars().count(),
                    self.link.stats_snapshot().summary()
                );
                Outcome::Completed(message)
            }
            Err(e) => self.link.terminate(e),
        }
    }

    async fn exchange(&mut self) -> Result<String> {
        let stream = self.connect().await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = PacketReader::new(read_half, self.config.max_packet_len);
        let mut writer = PacketWriter::new(write_half);

        self.respond(&mut writer, &request_packet()).await?;
        self.link.enter(SessionState::RequestSent);
        self.link.set_status("Request sent - waiting for message");

        loop {
            let packet = match reader.next_packet(self.link.cancel_token()).await? {
                Some(packet) => packet,
                None => return Err(Error::ConnectionLost),
            };
            self.link.enter(SessionState::Receiving);

            match self.assembler.add_packet(packet) {
                Ok(true) => self.link.update_stats(|stats| stats.packets_received += 1),
                Ok(false) => {
                    debug!("CLIENT - 중복 청크");
                    self.link.update_stats(|stats| stats.duplicate_packets += 1);
                }
                Err(e) => {
                    warn!("CLIENT - 청크 처리 실패: {}", e);
                    self.link.update_stats(|stats| stats.malformed_packets += 1);
                }
            }

            if let (Some(ratio), Some(total)) =
                (self.assembler.progress_ratio(), self.assembler.total_packets())
            {
                self.link.update_stats(|stats| stats.total_packets = total);
                self.link.publish(
                    format!("Receiving message: {:.2}% complete...", ratio * 100.0),
                    ratio,
                );
            }

            if self.assembler.received_all() {
                self.respond(&mut writer, &completed_packet()).await?;
                return self.assembler.full_message(self.config.trim_message);
            }

            if is_batch_end(&self.assembler) {
                self.link.enter(SessionState::ReportingMissing);
                match self.assembler.missing_sequence_numbers() {
                    Some(missing) => {
                        debug!("CLIENT - 누락 {}개 재전송 요청", missing.len());
                        self.respond(&mut writer, &nack_packet(&missing)).await?;
                        self.link.update_stats(|stats| stats.nacks_sent += 1);
                    }
                    None => {
                        // 총 패킷 수를 모르면 누락 목록을 만들 수 없음
                        warn!("CLIENT - 총 패킷 수 미확인, 메시지 재요청");
                        self.respond(&mut writer, &request_packet()).await?;
                    }
                }
            }
        }
    }

    /// 송신자 연결 (취소/타임아웃)
    async fn connect(&self) -> Result<TcpStream> {
        let timeout = self.config.connect_timeout();
        self.link
            .set_status(format!("Connecting to {}", self.server_addr));

        let connecting = tokio::time::timeout(timeout, TcpStream::connect(self.server_addr));
        tokio::select! {
            biased;
            _ = self.link.cancel_token().cancelled() => Err(Error::Cancelled),
            connected = connecting => match connected {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    info!("CLIENT - 서버 연결: {}", self.server_addr);
                    Ok(stream)
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(Error::ConnectionTimeout {
                    timeout_ms: self.config.connect_timeout_ms,
                }),
            },
        }
    }

    /// 응답 전송, 취소됐으면 아무것도 보내지 않음
    async fn respond(
        &self,
        writer: &mut PacketWriter<OwnedWriteHalf>,
        packet: &Packet,
    ) -> Result<()> {
        if self.link.is_cancelled() {
            return Err(Error::Cancelled);
        }
        writer.send(packet).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_config() {
        let config = Config {
            packet_drop_probability: 2.0,
            ..Config::default()
        };
        assert!(Receiver::new(config, "127.0.0.1:1".parse().unwrap()).is_err());

        let receiver = Receiver::new(Config::default(), "127.0.0.1:1".parse().unwrap()).unwrap();
        assert_eq!(receiver.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        // 바인딩 후 바로 닫은 포트
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let receiver = Receiver::new(Config::default(), addr).unwrap();
        let controller = receiver.controller();
        let outcome = receiver.run().await;

        assert!(matches!(outcome, Outcome::Failed(_)));
        assert!(matches!(controller.state(), SessionState::Failed(_)));
    }
}
