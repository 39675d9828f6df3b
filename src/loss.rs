//! 패킷 손실 시뮬레이션
//!
//! 송신측 전용. 배치의 마지막 패킷은 정책과 무관하게 항상 전송됨

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::SequenceNum;
use crate::Config;

/// 패킷 드롭 결정 함수
pub trait DropPolicy: Send + Sync {
    /// `seq` 패킷을 이번에 버릴지
    fn should_drop(&mut self, seq: SequenceNum) -> bool;
}

impl<F> DropPolicy for F
where
    F: FnMut(SequenceNum) -> bool + Send + Sync,
{
    fn should_drop(&mut self, seq: SequenceNum) -> bool {
        self(seq)
    }
}

/// 손실 없음
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLoss;

impl DropPolicy for NoLoss {
    fn should_drop(&mut self, _seq: SequenceNum) -> bool {
        false
    }
}

/// 고정 확률로 독립적으로 드롭
#[derive(Debug, Clone)]
pub struct RandomLoss {
    probability: f64,
    rng: StdRng,
}

impl RandomLoss {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            rng: StdRng::from_entropy(),
        }
    }

    /// 재현 가능한 시드 지정
    pub fn with_seed(probability: f64, seed: u64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl DropPolicy for RandomLoss {
    fn should_drop(&mut self, _seq: SequenceNum) -> bool {
        self.rng.gen_bool(self.probability)
    }
}

/// 설정에 맞는 정책 생성
pub fn from_config(config: &Config) -> Box<dyn DropPolicy> {
    if !config.simulate_packet_loss {
        return Box::new(NoLoss);
    }

    match config.loss_seed {
        Some(seed) => Box::new(RandomLoss::with_seed(config.packet_drop_probability, seed)),
        None => Box::new(RandomLoss::new(config.packet_drop_probability)),
    }
}
