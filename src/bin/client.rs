//! CMTP 클라이언트 (수신자) - Chunked Message Transfer Protocol
//!
//! 서버에 연결해 메시지를 요청하고 청크를 조립
//! - 배치 끝마다 누락 청크 NACK
//!
//! 사용법:
//!   cargo run --release --bin cmtp-client -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin cmtp-client -- --server 127.0.0.1:30121 --output received.txt

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cmtp::{Config, Outcome, Receiver, DEFAULT_PORT};

/// 클라이언트 설정
struct ClientConfig {
    server_addr: SocketAddr,
    output_path: Option<PathBuf>,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            output_path: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    config.config.connect_timeout_ms =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--trim" => {
                config.config.trim_message = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"CMTP Client - Chunked Message Transfer Protocol 클라이언트

서버에 메시지를 요청하고 청크를 조립
- 배치 끝마다 누락 청크 재전송 요청

사용법:
  cargo run --release --bin cmtp-client -- [OPTIONS]

옵션:
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:30121)
  -o, --output <PATH>     받은 메시지 저장 경로 (없으면 표준 출력)
  --timeout <MS>          연결 타임아웃 밀리초 (기본: 10000)
  --trim                  받은 메시지의 끝 공백 제거
  -h, --help              이 도움말 출력
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();

    info!("CMTP Client starting...");
    info!("Server address: {}", client_config.server_addr);

    let receiver = Receiver::new(client_config.config, client_config.server_addr)?;
    let handle = receiver.spawn();

    // 진행률 출력 (10% 단위)
    let mut progress = handle.subscribe();
    tokio::spawn(async move {
        let mut last_decile = 0;
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            let decile = (snapshot.ratio * 10.0) as u32;
            if decile > last_decile {
                info!("{}", snapshot.status);
                last_decile = decile;
            }
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

    let status = handle.controller().clone();
    match handle.join().await {
        Outcome::Completed(message) => {
            info!("{}", status.status());
            info!("Stats: {}", status.stats().summary());

            match &client_config.output_path {
                Some(path) => {
                    std::fs::write(path, &message)?;
                    info!("Saved {} bytes to {:?}", message.len(), path);
                }
                None => println!("{message}"),
            }
            Ok(())
        }
        Outcome::Failed(failure) => {
            warn!("{} ({})", status.status(), failure);
            std::process::exit(1);
        }
        Outcome::Cancelled => {
            warn!("{}", status.status());
            std::process::exit(130);
        }
    }
}
