//! CMTP 서버 (송신자) - Chunked Message Transfer Protocol
//!
//! 수신자 하나의 연결을 기다렸다가 메시지를 청크 배치로 전송
//! - NACK 기반 누락 청크 재전송
//! - 패킷 손실 시뮬레이션 (선택)
//!
//! 사용법:
//!   cargo run --release --bin cmtp-server -- [OPTIONS]
//!
//! 예시:
//!   # 파일 내용 전송
//!   cargo run --release --bin cmtp-server -- --bind 0.0.0.0:30121 --file message.txt
//!
//!   # 20% 손실 시뮬레이션
//!   cargo run --release --bin cmtp-server -- -f message.txt --drop 0.2 --seed 7

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cmtp::{Config, Outcome, Sender, DEFAULT_PORT};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    file_path: Option<PathBuf>,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            file_path: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--chunk-size" => {
                if i + 1 < args.len() {
                    config.config.chunk_size =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--drop" => {
                if i + 1 < args.len() {
                    config.config.packet_drop_probability =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    config.config.simulate_packet_loss = true;
                    config.config.shuffle_batches = true;
                    i += 1;
                }
            }
            "--seed" => {
                if i + 1 < args.len() {
                    config.config.loss_seed =
                        Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    config.config.accept_timeout_ms =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"CMTP Server - Chunked Message Transfer Protocol 서버

수신자 하나에게 메시지를 청크 단위로 전송
- 배치 전송 + NACK 기반 재전송
- 패킷 손실 시뮬레이션 지원

사용법:
  cargo run --release --bin cmtp-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:30121)
  -f, --file <PATH>       전송할 텍스트 파일 (없으면 데모 메시지)
  --chunk-size <CHARS>    청크 크기 문자 수 (기본: 1024)
  --drop <PROB>           손실 시뮬레이션 드롭 확률 0.0~1.0 미만 (배치 순서도 섞음)
  --seed <N>              손실 시뮬레이션 시드
  --timeout <MS>          연결 대기 타임아웃 밀리초 (기본: 60000)
  -h, --help              이 도움말 출력

예시:
  # 파일 내용 전송
  cargo run --release --bin cmtp-server -- --file message.txt

  # 불안정 네트워크 흉내
  cargo run --release --bin cmtp-server -- -f message.txt --chunk-size 256 --drop 0.45
"#
                );
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    config
}

/// 파일이 없을 때 보내는 데모 메시지
fn demo_message() -> String {
    (1..=200)
        .map(|n| format!("Line {n:03}: the quick brown fox jumps over the lazy dog\n"))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();

    info!("CMTP Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Chunk size: {} chars", server_config.config.chunk_size);
    if server_config.config.simulate_packet_loss {
        info!(
            "Packet loss simulation: {:.1}%",
            server_config.config.packet_drop_probability * 100.0
        );
    }

    // 전송할 메시지 준비
    let message = if let Some(path) = &server_config.file_path {
        info!("Loading file: {:?}", path);
        std::fs::read_to_string(path)?
    } else {
        info!("Using demo message");
        demo_message()
    };

    let sender = Sender::bind(server_config.config, server_config.bind_addr, message).await?;
    info!("Server listening on {}", sender.local_addr()?);

    let handle = sender.spawn();

    // 진행 상태 출력
    let mut progress = handle.subscribe();
    tokio::spawn(async move {
        let mut last_state = progress.borrow().state.clone();
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            if snapshot.state != last_state {
                info!("State: {} -> {}", last_state, snapshot.state);
                last_state = snapshot.state;
            }
            debug!("{}", snapshot.status);
        }
    });

    // Ctrl+C → 취소
    let controller = handle.controller().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling transfer");
            controller.cancel();
        }
    });

    match handle.join().await {
        Outcome::Completed(stats) => {
            info!("Transfer complete: {}", stats.summary());
            info!(
                "Packet retransmissions: {:.0}%",
                stats.retransmission_ratio() * 100.0
            );
            Ok(())
        }
        Outcome::Failed(failure) => {
            warn!("Transfer failed: {}", failure);
            std::process::exit(1);
        }
        Outcome::Cancelled => {
            warn!("Transfer cancelled");
            std::process::exit(130);
        }
    }
}
