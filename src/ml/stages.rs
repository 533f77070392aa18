//! 2段階学習の状態遷移
//!
//! HEAD（バックボーン凍結）-> FINE_TUNE（先頭 `fine_tune_at` 層以外を学習）-> DONE。
//! 遷移は純粋関数で、実際の学習を行わずに段階ごとの設定を検証できます。

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};

/// 学習段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStage {
    Head,
    FineTune,
    Done,
}

impl std::fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingStage::Head => write!(f, "head"),
            TrainingStage::FineTune => write!(f, "fine_tune"),
            TrainingStage::Done => write!(f, "done"),
        }
    }
}

/// バックボーン層ごとの学習可否
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFreezeState {
    trainable: Vec<bool>,
}

impl LayerFreezeState {
    /// 全層凍結
    pub fn all_frozen(num_layers: usize) -> Self {
        Self {
            trainable: vec![false; num_layers],
        }
    }

    /// インデックス `fine_tune_at` 未満を凍結、それ以降を学習可能にする
    pub fn fine_tune(num_layers: usize, fine_tune_at: usize) -> Self {
        Self {
            trainable: (0..num_layers).map(|i| i >= fine_tune_at).collect(),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.trainable.len()
    }

    pub fn is_trainable(&self, layer: usize) -> bool {
        self.trainable.get(layer).copied().unwrap_or(false)
    }

    pub fn trainable_count(&self) -> usize {
        self.trainable.iter().filter(|t| **t).count()
    }

    /// 先頭から連続して凍結されている層数
    pub fn frozen_prefix(&self) -> usize {
        self.trainable
            .iter()
            .position(|t| *t)
            .unwrap_or(self.trainable.len())
    }
}

/// 1段階の学習設定
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub stage: TrainingStage,
    pub learning_rate: f64,
    pub epochs: usize,
    pub freeze: LayerFreezeState,
}

/// 1段階の学習結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: TrainingStage,
    pub epochs_run: usize,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub early_stopped: bool,
    pub learning_rate: f64,
}

/// 遷移結果。`settings` が `None` なら学習終了
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: TrainingStage,
    pub settings: Option<StageSettings>,
}

/// 2段階学習のスケジュール
#[derive(Debug, Clone)]
pub struct FineTuneSchedule {
    head_epochs: usize,
    fine_tune_epochs: usize,
    head_learning_rate: f64,
    fine_tune_learning_rate: f64,
    fine_tune_at: usize,
    num_layers: usize,
}

impl FineTuneSchedule {
    pub fn new(
        head_epochs: usize,
        fine_tune_epochs: usize,
        head_learning_rate: f64,
        fine_tune_learning_rate: f64,
        fine_tune_at: usize,
        num_layers: usize,
    ) -> Result<Self> {
        if fine_tune_learning_rate >= head_learning_rate {
            return Err(ClassifierError::Config(format!(
                "fine-tune learning rate {} must be smaller than head learning rate {}",
                fine_tune_learning_rate, head_learning_rate
            )));
        }
        if fine_tune_at > num_layers {
            return Err(ClassifierError::Config(format!(
                "fine_tune_at {} exceeds the backbone layer count {}",
                fine_tune_at, num_layers
            )));
        }
        Ok(Self {
            head_epochs,
            fine_tune_epochs,
            head_learning_rate,
            fine_tune_learning_rate,
            fine_tune_at,
            num_layers,
        })
    }

    pub fn fine_tune_at(&self) -> usize {
        self.fine_tune_at
    }

    /// 段階ごとの設定
    pub fn settings(&self, stage: TrainingStage) -> Option<StageSettings> {
        match stage {
            TrainingStage::Head => Some(StageSettings {
                stage,
                learning_rate: self.head_learning_rate,
                epochs: self.head_epochs,
                freeze: LayerFreezeState::all_frozen(self.num_layers),
            }),
            TrainingStage::FineTune => Some(StageSettings {
                stage,
                learning_rate: self.fine_tune_learning_rate,
                epochs: self.fine_tune_epochs,
                freeze: LayerFreezeState::fine_tune(self.num_layers, self.fine_tune_at),
            }),
            TrainingStage::Done => None,
        }
    }

    pub fn initial(&self) -> Option<StageSettings> {
        self.settings(TrainingStage::Head)
    }

    /// 現在の段階と結果から次の段階を決める
    ///
    /// HEAD の後は結果（早期終了を含む）に関わらず FINE_TUNE に進む。
    pub fn transition(&self, current: TrainingStage, _outcome: &StageOutcome) -> Transition {
        let next = match current {
            TrainingStage::Head => TrainingStage::FineTune,
            TrainingStage::FineTune | TrainingStage::Done => TrainingStage::Done,
        };
        Transition {
            next,
            settings: self.settings(next),
        }
    }
}

/// 早期終了の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStopDecision {
    Improved,
    Continue,
    Stop,
}

/// 検証損失を監視する早期終了（段階ごとにリセット）
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<f64>,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            best_epoch: None,
            wait: 0,
        }
    }

    pub fn update(&mut self, epoch: usize, val_loss: f64) -> EarlyStopDecision {
        let improved = match self.best {
            None => val_loss.is_finite(),
            Some(best) => val_loss < best,
        };
        if improved {
            self.best = Some(val_loss);
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return EarlyStopDecision::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            EarlyStopDecision::Stop
        } else {
            EarlyStopDecision::Continue
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

/// 学習全体（両段階）で最良の検証損失を追跡し、保存の要否を返す
#[derive(Debug, Clone, Default)]
pub struct CheckpointTracker {
    best: Option<f64>,
    saves: usize,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 改善していれば true（チェックポイントを保存する）
    pub fn observe(&mut self, val_loss: f64) -> bool {
        let improved = match self.best {
            None => val_loss.is_finite(),
            Some(best) => val_loss < best,
        };
        if improved {
            self.best = Some(val_loss);
            self.saves += 1;
        }
        improved
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn saves(&self) -> usize {
        self.saves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> FineTuneSchedule {
        FineTuneSchedule::new(5, 8, 1e-3, 1e-5, 12, 19).unwrap()
    }

    fn outcome(stage: TrainingStage, early_stopped: bool) -> StageOutcome {
        StageOutcome {
            stage,
            epochs_run: 2,
            best_val_loss: Some(0.4),
            best_epoch: Some(1),
            early_stopped,
            learning_rate: 1e-3,
        }
    }

    #[test]
    fn test_head_stage_freezes_everything() {
        let head = schedule().initial().unwrap();
        assert_eq!(head.stage, TrainingStage::Head);
        assert_eq!(head.learning_rate, 1e-3);
        assert_eq!(head.epochs, 5);
        assert_eq!(head.freeze.trainable_count(), 0);
        assert_eq!(head.freeze.frozen_prefix(), 19);
    }

    #[test]
    fn test_fine_tune_freeze_invariant() {
        let schedule = schedule();
        let t = schedule.transition(TrainingStage::Head, &outcome(TrainingStage::Head, false));
        assert_eq!(t.next, TrainingStage::FineTune);
        let ft = t.settings.unwrap();
        assert_eq!(ft.learning_rate, 1e-5);
        assert_eq!(ft.epochs, 8);
        for i in 0..19 {
            assert_eq!(ft.freeze.is_trainable(i), i >= 12, "layer {}", i);
        }
        assert_eq!(ft.freeze.frozen_prefix(), 12);
    }

    #[test]
    fn test_head_early_stop_still_enters_fine_tune() {
        let schedule = schedule();
        let t = schedule.transition(TrainingStage::Head, &outcome(TrainingStage::Head, true));
        assert_eq!(t.next, TrainingStage::FineTune);

        let t = schedule.transition(TrainingStage::FineTune, &outcome(TrainingStage::FineTune, false));
        assert_eq!(t.next, TrainingStage::Done);
        assert!(t.settings.is_none());
    }

    #[test]
    fn test_schedule_rejects_non_decreasing_lr() {
        assert!(FineTuneSchedule::new(1, 1, 1e-5, 1e-5, 0, 19).is_err());
        assert!(FineTuneSchedule::new(1, 1, 1e-3, 1e-5, 20, 19).is_err());
    }

    #[test]
    fn test_early_stopping_patience() {
        let mut es = EarlyStopping::new(2);
        assert_eq!(es.update(0, 0.9), EarlyStopDecision::Improved);
        assert_eq!(es.update(1, 0.8), EarlyStopDecision::Improved);
        assert_eq!(es.update(2, 0.8), EarlyStopDecision::Continue);
        assert_eq!(es.update(3, 0.85), EarlyStopDecision::Stop);
        assert_eq!(es.best(), Some(0.8));
        assert_eq!(es.best_epoch(), Some(1));
    }

    #[test]
    fn test_checkpoint_tracker_spans_stages() {
        let mut tracker = CheckpointTracker::new();
        assert!(tracker.observe(0.5));
        assert!(!tracker.observe(0.6));
        // 次の段階でも全体の最良値と比較する
        assert!(!tracker.observe(0.55));
        assert!(tracker.observe(0.3));
        assert_eq!(tracker.saves(), 2);
        assert_eq!(tracker.best(), Some(0.3));
    }

    #[test]
    fn test_nan_loss_is_never_an_improvement() {
        let mut tracker = CheckpointTracker::new();
        assert!(!tracker.observe(f64::NAN));
        let mut es = EarlyStopping::new(1);
        assert_eq!(es.update(0, f64::NAN), EarlyStopDecision::Stop);
    }
}
