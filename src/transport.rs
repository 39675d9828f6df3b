//! TCP 스트림 위의 패킷 읽기/쓰기

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::packet::{Packet, PacketDecoder};
use crate::session::CancelToken;
use crate::{Error, Result};

/// 상대가 연결을 끊었을 때 나오는 에러 종류
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// 패킷 읽기
#[derive(Debug)]
pub struct PacketReader<R> {
    inner: BufReader<R>,
    max_packet_len: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R, max_packet_len: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_packet_len,
        }
    }

    /// 다음 패킷 하나 읽기
    ///
    /// 스트림이 끝나면 `Ok(None)` (패킷 중간이어도 동일).
    /// 첫 바이트를 기다리는 동안만 취소에 반응하고, 읽기 시작한 패킷은 끝까지 읽음.
    ///
    /// 길이 헤더가 손상되면 패킷 경계를 다시 찾을 수 없으므로 `MalformedPacket` 에러
    pub async fn next_packet(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<Option<PacketDecoder>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            byte = self.inner.read_u8() => byte,
        };
        let first = match first {
            Ok(byte) => byte,
            Err(e) if is_disconnect(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut decoder = PacketDecoder::with_limit(first, self.max_packet_len);
        while !decoder.is_complete() {
            match decoder.declared_len() {
                // 헤더를 다 읽었으면 나머지 페이로드를 한 번에
                Some(declared) => {
                    let mut rest = vec![0u8; declared - decoder.payload().len()];
                    match self.inner.read_exact(&mut rest).await {
                        Ok(_) => decoder.extend(&rest),
                        Err(e) if is_disconnect(&e) => return Ok(None),
                        Err(e) => return Err(e.into()),
                    }
                }
                None => match self.inner.read_u8().await {
                    Ok(byte) => decoder.push(byte),
                    Err(e) if is_disconnect(&e) => return Ok(None),
                    Err(e) => return Err(e.into()),
                },
            }
        }

        if let Some(reason) = decoder.corruption() {
            warn!("손상된 패킷 헤더: {:?} ({})", decoder.packet_string(), reason);
            return Err(Error::malformed(format!(
                "길이 헤더 손상, 스트림 동기화 불가: {reason}"
            )));
        }

        debug!("패킷 수신: {} bytes", decoder.wire_len());
        Ok(Some(decoder))
    }
}

/// 패킷 쓰기
#[derive(Debug)]
pub struct PacketWriter<W> {
    inner: W,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }

    /// 패킷 하나 쓰고 flush, 쓴 바이트 수 반환
    pub async fn send(&mut self, packet: &Packet) -> Result<usize> {
        let bytes = packet.encode();

        let written = async {
            self.inner.write_all(&bytes).await?;
            self.inner.flush().await
        };
        match written.await {
            Ok(()) => {}
            Err(e) if is_disconnect(&e) => return Err(Error::ConnectionLost),
            Err(e) => return Err(e.into()),
        }

        self.bytes_written += bytes.len() as u64;
        debug!("패킷 송신: {} bytes", bytes.len());
        Ok(bytes.len())
    }

    /// 지금까지 쓴 총 바이트 수
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// 쓰기 방향 종료
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
