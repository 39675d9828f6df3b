//! 루프백 TCP 위의 전체 전송 시나리오

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use cmtp::message::{completed_packet, nack_packet, request_packet};
use cmtp::session::{self, SessionLink};
use cmtp::transport::{PacketReader, PacketWriter};
use cmtp::{
    ArgKey, Config, Delivery, Failure, MessageAssembler, MessageChunker, Outcome, Packet,
    PacketDecoder, Receiver, Role, Sender, SequenceNum, SessionState, TransferRequest,
    TransferStats, MAX_PACKET_LEN,
};

const WAIT: Duration = Duration::from_secs(10);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// 송신자와 수신자를 함께 돌려 두 결과를 반환
async fn run_pair(
    sender: Sender,
    receiver_config: Config,
) -> (Outcome<TransferStats>, Outcome<String>) {
    let addr = sender.local_addr().unwrap();
    let sending = sender.spawn();
    let receiving = Receiver::new(receiver_config, addr).unwrap().spawn();

    tokio::time::timeout(WAIT, async { tokio::join!(sending.join(), receiving.join()) })
        .await
        .expect("전송이 제시간에 끝나야 함")
}

/// 프로토콜을 직접 말하는 상대편
struct RawPeer {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
    link: SessionLink,
}

impl RawPeer {
    fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: PacketReader::new(read_half, MAX_PACKET_LEN),
            writer: PacketWriter::new(write_half),
            link: SessionLink::new(Role::Receiver),
        }
    }

    async fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.unwrap())
    }

    async fn recv(&mut self) -> Option<PacketDecoder> {
        tokio::time::timeout(WAIT, self.reader.next_packet(self.link.cancel_token()))
            .await
            .expect("패킷 대기 타임아웃")
            .unwrap()
    }

    async fn send(&mut self, packet: &Packet) {
        self.writer.send(packet).await.unwrap();
    }
}

#[tokio::test]
async fn test_hello_world_in_three_chunks() {
    let config = Config {
        chunk_size: 5,
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), "hello world").await.unwrap();
    let (sent, received) = run_pair(sender, Config::default()).await;

    assert_eq!(received, Outcome::Completed("hello world".to_string()));
    let stats = sent.completed().expect("송신 완료");
    assert_eq!(stats.total_packets, 3);
    assert_eq!(stats.packets_sent, 3);
    assert_eq!(stats.retransmitted_packets, 0);
    assert_eq!(stats.batches, 1);
}

#[tokio::test]
async fn test_multibyte_message_with_line_breaks() {
    let message = "첫 줄입니다\n두 번째 줄 🚀\r\n세 번째: a;b|c=d\\e";
    let config = Config {
        chunk_size: 3,
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), message).await.unwrap();
    let (sent, received) = run_pair(sender, Config::default()).await;

    assert!(sent.is_completed());
    assert_eq!(received.completed().as_deref(), Some(message));
}

#[tokio::test]
async fn test_trailing_whitespace_arrives_intact() {
    let message = "line one\nline two\n  \t\n";
    let config = Config {
        chunk_size: 4,
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), message).await.unwrap();
    let (sent, received) = run_pair(sender, Config::default()).await;

    assert!(sent.is_completed());
    assert_eq!(received.completed().as_deref(), Some(message));
}

#[tokio::test]
async fn test_trim_is_opt_in() {
    let sender = Sender::bind(Config::default(), loopback(), "padded  \n")
        .await
        .unwrap();
    let receiver_config = Config {
        trim_message: true,
        ..Config::default()
    };
    let (_, received) = run_pair(sender, receiver_config).await;

    assert_eq!(received.completed().as_deref(), Some("padded"));
}

#[tokio::test]
async fn test_empty_message() {
    let sender = Sender::bind(Config::default(), loopback(), "").await.unwrap();
    let addr = sender.local_addr().unwrap();
    let sending = sender.spawn();
    let receiving = Receiver::new(Config::default(), addr).unwrap().spawn();
    let status = receiving.controller().clone();

    let (sent, received) =
        tokio::time::timeout(WAIT, async { tokio::join!(sending.join(), receiving.join()) })
            .await
            .unwrap();

    assert!(sent.is_completed());
    assert_eq!(received, Outcome::Completed(String::new()));
    assert_eq!(status.status(), "Empty message received");
    assert_eq!(status.state(), SessionState::Done);
}

#[tokio::test]
async fn test_sender_retransmits_exactly_missing() {
    let message = "abcdefghij";
    let config = Config {
        chunk_size: 1,
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), message).await.unwrap();
    let addr = sender.local_addr().unwrap();
    let handle = sender.spawn();

    let mut peer = RawPeer::connect(addr).await;
    peer.send(&request_packet()).await;

    let withheld: [SequenceNum; 3] = [2, 5, 9];
    let mut assembler = MessageAssembler::new();
    let mut batch_end_seen = false;
    for _ in 0..10 {
        let packet = peer.recv().await.expect("청크 수신");
        let seq = packet.get_u32_arg(ArgKey::SequenceNum).unwrap();
        if packet.contains_arg(ArgKey::Completed) {
            assert_eq!(seq, 9);
            batch_end_seen = true;
        }
        if !withheld.contains(&seq) {
            assembler.add_packet(packet).unwrap();
        }
    }
    assert!(batch_end_seen);
    assert_eq!(assembler.missing_sequence_numbers(), Some(vec![2, 5, 9]));

    peer.send(&nack_packet(&withheld)).await;

    let mut resent = Vec::new();
    for i in 0..3 {
        let packet = peer.recv().await.expect("재전송 청크 수신");
        resent.push(packet.get_u32_arg(ArgKey::SequenceNum).unwrap());
        if i == 2 {
            assert_eq!(packet.get_arg(ArgKey::Completed).unwrap(), "T");
        }
        assembler.add_packet(packet).unwrap();
    }
    resent.sort_unstable();
    assert_eq!(resent, vec![2, 5, 9]);
    assert_eq!(assembler.full_message(true).unwrap(), message);

    peer.send(&completed_packet()).await;

    let stats = tokio::time::timeout(WAIT, handle.join())
        .await
        .unwrap()
        .completed()
        .expect("송신 완료");
    assert_eq!(stats.packets_sent, 13);
    assert_eq!(stats.retransmitted_packets, 3);
    assert_eq!(stats.nacks_received, 1);
    assert_eq!(stats.batches, 2);
}

#[tokio::test]
async fn test_forced_drops_recover_through_nack() {
    let message = "0123456789";
    let config = Config {
        chunk_size: 1,
        ..Config::default()
    };

    let mut pending: HashSet<SequenceNum> = [2, 5].into_iter().collect();
    let sender = Sender::bind(config, loopback(), message)
        .await
        .unwrap()
        .with_drop_policy(move |seq: SequenceNum| pending.remove(&seq));

    let (sent, received) = run_pair(sender, Config::default()).await;

    assert_eq!(received.completed().as_deref(), Some(message));
    let stats = sent.completed().expect("송신 완료");
    assert_eq!(stats.packets_dropped, 2);
    assert_eq!(stats.retransmitted_packets, 2);
    assert_eq!(stats.nacks_received, 1);
    assert_eq!(stats.packets_on_wire(), 10);
}

#[tokio::test]
async fn test_last_packet_of_batch_is_never_dropped() {
    let message = "abcd";
    let config = Config {
        chunk_size: 1,
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), message)
        .await
        .unwrap()
        .with_drop_policy(|_seq: SequenceNum| true);
    let addr = sender.local_addr().unwrap();
    let handle = sender.spawn();

    let mut peer = RawPeer::connect(addr).await;
    peer.send(&request_packet()).await;

    // 나머지는 전부 드롭, 배치 끝 패킷만 도착
    let packet = peer.recv().await.unwrap();
    assert_eq!(packet.get_u32_arg(ArgKey::SequenceNum).unwrap(), 3);
    assert_eq!(packet.get_arg(ArgKey::Completed).unwrap(), "T");

    handle.cancel();
    drop(peer);
    let outcome = tokio::time::timeout(WAIT, handle.join()).await.unwrap();
    assert!(!outcome.is_completed());
}

#[tokio::test]
async fn test_seeded_random_loss_end_to_end() {
    let mut rng = StdRng::seed_from_u64(2024);
    let message: String = (0..1999)
        .map(|i| {
            if i % 80 == 79 {
                '\n'
            } else {
                char::from(rng.sample(Alphanumeric))
            }
        })
        .collect();

    let config = Config {
        chunk_size: 16,
        simulate_packet_loss: true,
        packet_drop_probability: 0.3,
        shuffle_batches: true,
        loss_seed: Some(7),
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), message.as_str()).await.unwrap();
    let addr = sender.local_addr().unwrap();
    let sending = sender.spawn();
    let receiving = Receiver::new(Config::default(), addr).unwrap().spawn();
    let receiver_status = receiving.controller().clone();

    let (sent, received) =
        tokio::time::timeout(WAIT, async { tokio::join!(sending.join(), receiving.join()) })
            .await
            .unwrap();

    assert_eq!(received.completed().as_deref(), Some(message.as_str()));

    let stats = sent.completed().expect("송신 완료");
    assert_eq!(stats.total_packets, 125);
    assert!(stats.packets_dropped > 0);
    assert!(stats.retransmitted_packets > 0);
    assert_eq!(
        stats.packets_sent,
        u64::from(stats.total_packets) + stats.retransmitted_packets
    );
    assert_eq!(stats.nacks_received, stats.batches - 1);

    let receiver_stats = receiver_status.stats();
    assert_eq!(receiver_stats.packets_received, 125);
    assert_eq!(receiver_stats.nacks_sent, stats.nacks_received);
    assert_eq!(receiver_status.progress(), 1.0);
}

#[tokio::test]
async fn test_receiver_cancel_sends_nothing() {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = Receiver::new(Config::default(), addr).unwrap().spawn();
    let controller = handle.controller().clone();

    let (stream, _) = listener.accept().await.unwrap();
    let mut peer = RawPeer::new(stream);

    let request = peer.recv().await.expect("요청 수신");
    assert_eq!(request.get_arg(ArgKey::RequestType).unwrap(), "MESSAGE");

    // 3개 중 2개만 보내고 배치 끝 표시 없음
    let chunker = MessageChunker::new("hello world", 5, &Packet::new()).unwrap();
    for seq in 0..2 {
        peer.send(chunker.packet(seq).unwrap()).await;
    }

    let mut progress = handle.subscribe();
    tokio::time::timeout(WAIT, progress.wait_for(|p| p.ratio > 0.6))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(controller.state(), SessionState::Receiving);

    handle.cancel();
    let outcome = tokio::time::timeout(WAIT, handle.join()).await.unwrap();

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(controller.state(), SessionState::Cancelled);
    assert_eq!(controller.status(), "Task cancelled - message not received");

    // 완료나 NACK 없이 스트림 종료
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn test_receiver_cancelled_mid_batch_against_sender() {
    let config = Config {
        chunk_size: 1,
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), "abcde").await.unwrap();
    let addr = sender.local_addr().unwrap();

    let receiver = Receiver::new(Config::default(), addr).unwrap();
    let receiver_control = receiver.controller();

    // 세 번째 청크를 보내기 직전에 수신자 취소
    let trigger = receiver_control.clone();
    let sender = sender.with_drop_policy(move |seq: SequenceNum| {
        if seq == 2 {
            trigger.cancel();
        }
        false
    });
    let sender_control = sender.controller();

    let sending = sender.spawn();
    let receiving = receiver.spawn();
    let (sent, received) =
        tokio::time::timeout(WAIT, async { tokio::join!(sending.join(), receiving.join()) })
            .await
            .expect("양쪽 모두 종료되어야 함");

    assert_eq!(received, Outcome::Cancelled);
    assert_eq!(receiver_control.state(), SessionState::Cancelled);
    assert_eq!(receiver_control.status(), "Task cancelled - message not received");

    assert!(matches!(sent, Outcome::Failed(Failure::ConnectionLost)));
    assert_eq!(
        sender_control.state(),
        SessionState::Failed(Failure::ConnectionLost)
    );
    assert_eq!(sender_control.stats().nacks_received, 0);
}

#[tokio::test]
async fn test_oversized_chunk_fails_both_sides() {
    let config = Config {
        chunk_size: 40,
        ..Config::default()
    };
    let message = "x".repeat(120);
    let sender = Sender::bind(config, loopback(), message).await.unwrap();
    let sender_control = sender.controller();

    // 청크 하나가 수신자 한도보다 큼
    let receiver_config = Config {
        max_packet_len: 32,
        ..Config::default()
    };
    let addr = sender.local_addr().unwrap();
    let receiving = Receiver::new(receiver_config, addr).unwrap().spawn();
    let receiver_control = receiving.controller().clone();
    let sending = sender.spawn();

    let (sent, received) =
        tokio::time::timeout(WAIT, async { tokio::join!(sending.join(), receiving.join()) })
            .await
            .expect("양쪽 모두 종료되어야 함");

    assert!(matches!(received, Outcome::Failed(Failure::Connection(_))));
    assert_eq!(receiver_control.status(), "Connection error");
    assert!(matches!(sent, Outcome::Failed(Failure::ConnectionLost)));
    assert_eq!(
        sender_control.state(),
        SessionState::Failed(Failure::ConnectionLost)
    );
}

#[tokio::test]
async fn test_sender_reports_lost_connection() {
    let config = Config {
        chunk_size: 5,
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), "hello world").await.unwrap();
    let addr = sender.local_addr().unwrap();
    let handle = sender.spawn();
    let controller = handle.controller().clone();

    let mut peer = RawPeer::connect(addr).await;
    peer.send(&request_packet()).await;
    for _ in 0..3 {
        peer.recv().await.expect("청크 수신");
    }
    drop(peer);

    let outcome = tokio::time::timeout(WAIT, handle.join()).await.unwrap();
    assert!(matches!(outcome, Outcome::Failed(Failure::ConnectionLost)));
    assert_eq!(
        controller.state(),
        SessionState::Failed(Failure::ConnectionLost)
    );
    assert_eq!(
        controller.status(),
        "Lost connection to the client - message not sent"
    );
}

#[tokio::test]
async fn test_sender_times_out_without_peer() {
    let config = Config {
        accept_timeout_ms: 100,
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), "nobody listens").await.unwrap();
    let handle = sender.spawn();
    let controller = handle.controller().clone();

    let outcome = tokio::time::timeout(WAIT, handle.join()).await.unwrap();

    assert_eq!(outcome.completed().map(|_| ()), None);
    assert_eq!(
        controller.state(),
        SessionState::Failed(Failure::Timeout { waited_ms: 100 })
    );
    assert_eq!(
        controller.status(),
        "Server timed out while waiting for client connection for 100ms"
    );
}

#[tokio::test]
async fn test_sender_cancel_while_waiting() {
    let sender = Sender::bind(Config::default(), loopback(), "never sent")
        .await
        .unwrap();
    let handle = sender.spawn();

    handle.cancel();
    let outcome = tokio::time::timeout(WAIT, handle.join()).await.unwrap();
    assert!(matches!(outcome, Outcome::Cancelled));
}

#[tokio::test]
async fn test_sender_ignores_control_before_request() {
    let config = Config {
        chunk_size: 4,
        ..Config::default()
    };
    let sender = Sender::bind(config, loopback(), "early bird").await.unwrap();
    let addr = sender.local_addr().unwrap();
    let handle = sender.spawn();

    let mut peer = RawPeer::connect(addr).await;
    peer.send(&completed_packet()).await;
    peer.send(&nack_packet(&[0])).await;
    peer.send(&request_packet()).await;

    let mut assembler = MessageAssembler::new();
    while !assembler.received_all() {
        let packet = peer.recv().await.expect("청크 수신");
        assembler.add_packet(packet).unwrap();
    }
    assert_eq!(assembler.full_message(true).unwrap(), "early bird");
    peer.send(&completed_packet()).await;

    let outcome = tokio::time::timeout(WAIT, handle.join()).await.unwrap();
    let stats = outcome.completed().expect("송신 완료");
    assert_eq!(stats.packets_sent, 3);
    assert_eq!(stats.nacks_received, 0);
}

#[tokio::test]
async fn test_start_runs_both_roles() {
    // 빈 포트 하나 확보
    let bind_addr = TcpListener::bind(loopback())
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let message = "started through the session entry point".to_string();
    let sending = session::start(
        Config::default(),
        TransferRequest::Send {
            bind_addr,
            message: message.clone(),
        },
    )
    .await
    .unwrap();
    let receiving = session::start(
        Config::default(),
        TransferRequest::Receive {
            server_addr: bind_addr,
        },
    )
    .await
    .unwrap();

    let (sent, received) =
        tokio::time::timeout(WAIT, async { tokio::join!(sending.join(), receiving.join()) })
            .await
            .unwrap();

    assert!(matches!(sent, Outcome::Completed(Delivery::Sent(_))));
    match received {
        Outcome::Completed(Delivery::Received(text)) => assert_eq!(text, message),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
