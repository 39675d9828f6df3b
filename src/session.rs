//! 전송 세션 상태와 호출자 인터페이스
//!
//! - 세션 하나 = 연결 하나, 전용 tokio 태스크에서 실행
//! - 진행 상태는 watch 채널로 발행 (단일 작성자, 다수 구독자)
//! - 취소는 협조적: 패킷 사이에서만 확인

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::stats::TransferStats;
use crate::{Config, Error, Result};

/// 세션 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("SERVER"),
            Role::Receiver => f.write_str("CLIENT"),
        }
    }
}

/// 실패 사유
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// 연결 대기/시도 시간 초과
    Timeout { waited_ms: u64 },

    /// 완료 전에 스트림 종료
    ConnectionLost,

    /// 소켓 에러
    Connection(String),

    /// 워커 태스크 비정상 종료
    Worker(String),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Timeout { .. } => f.write_str("timeout"),
            Failure::ConnectionLost => f.write_str("connection lost"),
            Failure::Connection(reason) => write!(f, "connection error: {reason}"),
            Failure::Worker(reason) => write!(f, "worker error: {reason}"),
        }
    }
}

/// 세션 상태 (두 역할 공용)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    // 송신자
    AwaitingConnection,
    Sending,
    AwaitingAck,
    Retransmitting,

    // 수신자
    Connecting,
    RequestSent,
    Receiving,
    ReportingMissing,

    // 종료
    Done,
    Failed(Failure),
    Cancelled,
}

impl SessionState {
    /// 역할별 시작 상태
    pub fn initial(role: Role) -> Self {
        match role {
            Role::Sender => SessionState::AwaitingConnection,
            Role::Receiver => SessionState::Connecting,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Failed(_) | SessionState::Cancelled
        )
    }

    /// 허용된 전이인지
    pub fn can_transition(&self, role: Role, next: &SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }

        match (role, self, next) {
            (_, _, Failed(_) | Cancelled) => true,

            (Role::Sender, AwaitingConnection, Sending) => true,
            (Role::Sender, Sending, AwaitingAck) => true,
            (Role::Sender, AwaitingAck, Sending | Retransmitting | Done) => true,
            (Role::Sender, Retransmitting, AwaitingAck) => true,

            (Role::Receiver, Connecting, RequestSent) => true,
            (Role::Receiver, RequestSent, Receiving) => true,
            (Role::Receiver, Receiving, ReportingMissing | Done) => true,
            (Role::Receiver, ReportingMissing, Receiving) => true,

            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(failure) => write!(f, "Failed({failure})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// 발행되는 진행 상태
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub state: SessionState,

    /// 사람이 읽는 상태 문구
    pub status: String,

    /// 진행률 (0.0 ~ 1.0)
    pub ratio: f64,
}

/// 세션 종료 결과
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Failed(Failure),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Failed(failure) => Outcome::Failed(failure),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    /// 결과에 대응하는 종료 상태
    pub fn terminal_state(&self) -> SessionState {
        match self {
            Outcome::Completed(_) => SessionState::Done,
            Outcome::Failed(failure) => SessionState::Failed(failure.clone()),
            Outcome::Cancelled => SessionState::Cancelled,
        }
    }
}

/// 취소 토큰 (워커측)
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// 취소될 때까지 대기 (취소 핸들이 사라지면 영원히 대기)
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// 워커가 상태를 발행하는 통로
#[derive(Debug, Clone)]
pub struct SessionLink {
    role: Role,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel: CancelToken,
    progress_tx: Arc<watch::Sender<Progress>>,
    stats: Arc<RwLock<TransferStats>>,
}

impl SessionLink {
    pub fn new(role: Role) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, _) = watch::channel(Progress {
            state: SessionState::initial(role),
            status: String::new(),
            ratio: 0.0,
        });

        Self {
            role,
            cancel_tx: Arc::new(cancel_tx),
            cancel: CancelToken { rx: cancel_rx },
            progress_tx: Arc::new(progress_tx),
            stats: Arc::new(RwLock::new(TransferStats::new())),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> SessionState {
        self.progress_tx.borrow().state.clone()
    }

    /// 상태 전이, 허용되지 않으면 무시하고 false
    pub fn enter(&self, next: SessionState) -> bool {
        let current = self.state();
        if current == next {
            return true;
        }
        if !current.can_transition(self.role, &next) {
            warn!("{} - 잘못된 상태 전이 무시: {} -> {}", self.role, current, next);
            return false;
        }

        debug!("{} - 상태 전이: {} -> {}", self.role, current, next);
        self.progress_tx.send_modify(|progress| progress.state = next);
        true
    }

    /// 상태 문구와 진행률 발행
    pub fn publish(&self, status: impl Into<String>, ratio: f64) {
        let status = status.into();
        self.progress_tx.send_modify(|progress| {
            progress.status = status;
            progress.ratio = ratio.clamp(0.0, 1.0);
        });
    }

    /// 상태 문구만 발행
    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.progress_tx
            .send_modify(|progress| progress.status = status);
    }

    /// 통계 갱신
    pub fn update_stats<R>(&self, f: impl FnOnce(&mut TransferStats) -> R) -> R {
        f(&mut self.stats.write())
    }

    pub fn stats_snapshot(&self) -> TransferStats {
        self.stats.read().clone()
    }

    /// 에러를 종료 결과로 변환하고 상태 발행
    pub fn terminate<T>(&self, error: Error) -> Outcome<T> {
        let outcome = match error {
            Error::Cancelled => Outcome::Cancelled,
            Error::ConnectionLost => Outcome::Failed(Failure::ConnectionLost),
            Error::ConnectionTimeout { timeout_ms } => Outcome::Failed(Failure::Timeout {
                waited_ms: timeout_ms,
            }),
            other => Outcome::Failed(Failure::Connection(other.to_string())),
        };

        let status = match (&outcome, self.role) {
            (Outcome::Cancelled, Role::Sender) => "Task cancelled - message not sent".to_string(),
            (Outcome::Cancelled, Role::Receiver) => {
                "Task cancelled - message not received".to_string()
            }
            (Outcome::Failed(Failure::ConnectionLost), Role::Sender) => {
                "Lost connection to the client - message not sent".to_string()
            }
            (Outcome::Failed(Failure::ConnectionLost), Role::Receiver) => {
                "Lost connection to the server - message not received".to_string()
            }
            (Outcome::Failed(Failure::Timeout { waited_ms }), Role::Sender) => format!(
                "Server timed out while waiting for client connection for {waited_ms}ms"
            ),
            (Outcome::Failed(Failure::Timeout { waited_ms }), Role::Receiver) => {
                format!("Timed out connecting to the server after {waited_ms}ms")
            }
            _ => "Connection error".to_string(),
        };

        match &outcome {
            Outcome::Cancelled => info!("{} - {}", self.role, status),
            Outcome::Failed(failure) => warn!("{} - {} ({})", self.role, status, failure),
            Outcome::Completed(_) => {}
        }

        self.enter(outcome.terminal_state());
        self.set_status(status);
        outcome
    }

    /// 호출자용 컨트롤러
    pub fn controller(&self) -> SessionController {
        SessionController {
            role: self.role,
            cancel_tx: Arc::clone(&self.cancel_tx),
            progress_rx: self.progress_tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// 호출자측 세션 제어 (복제 가능)
#[derive(Debug, Clone)]
pub struct SessionController {
    role: Role,
    cancel_tx: Arc<watch::Sender<bool>>,
    progress_rx: watch::Receiver<Progress>,
    stats: Arc<RwLock<TransferStats>>,
}

impl SessionController {
    pub fn role(&self) -> Role {
        self.role
    }

    /// 취소 요청
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// 현재 진행률 (0.0 ~ 1.0)
    pub fn progress(&self) -> f64 {
        self.progress_rx.borrow().ratio
    }

    /// 현재 상태 문구
    pub fn status(&self) -> String {
        self.progress_rx.borrow().status.clone()
    }

    pub fn state(&self) -> SessionState {
        self.progress_rx.borrow().state.clone()
    }

    pub fn snapshot(&self) -> Progress {
        self.progress_rx.borrow().clone()
    }

    /// 진행 상태 구독
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress_rx.clone()
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }
}

/// 실행 중인 전송 핸들
#[derive(Debug)]
pub struct TransferHandle<T> {
    controller: SessionController,
    task: JoinHandle<Outcome<T>>,
}

impl<T: Send + 'static> TransferHandle<T> {
    /// 전용 태스크에서 세션 실행
    pub fn spawn<F>(controller: SessionController, session: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self {
            controller,
            task: tokio::spawn(session),
        }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 종료까지 대기 (워커 패닉도 실패로 보고)
    pub async fn join(self) -> Outcome<T> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{} - 워커 비정상 종료: {}", self.controller.role, e);
                Outcome::Failed(Failure::Worker(e.to_string()))
            }
        }
    }
}

impl<T> Deref for TransferHandle<T> {
    type Target = SessionController;

    fn deref(&self) -> &SessionController {
        &self.controller
    }
}

/// 시작할 전송
#[derive(Debug, Clone)]
pub enum TransferRequest {
    /// `bind_addr`에서 수신자 하나를 기다려 `message` 전송
    Send {
        bind_addr: SocketAddr,
        message: String,
    },

    /// `server_addr`에 연결해 메시지 수신
    Receive { server_addr: SocketAddr },
}

/// 완료된 전송 결과
#[derive(Debug, Clone)]
pub enum Delivery {
    Sent(TransferStats),
    Received(String),
}

/// 역할에 맞는 세션을 시작
pub async fn start(config: Config, request: TransferRequest) -> Result<TransferHandle<Delivery>> {
    match request {
        TransferRequest::Send { bind_addr, message } => {
            let sender = Sender::bind(config, bind_addr, message).await?;
            let controller = sender.controller();
            Ok(TransferHandle::spawn(controller, async move {
                sender.run().await.map(Delivery::Sent)
            }))
        }
        TransferRequest::Receive { server_addr } => {
            let receiver = Receiver::new(config, server_addr)?;
            let controller = receiver.controller();
            Ok(TransferHandle::spawn(controller, async move {
                receiver.run().await.map(Delivery::Received)
            }))
        }
    }
}
