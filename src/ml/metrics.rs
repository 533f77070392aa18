//! 二値分類の評価指標
//!
//! 損失・正解率・ROC-AUC・混同行列をホスト側の確率とラベルから計算します。

use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::error::{ClassifierError, Result};
use crate::model::ClassMapping;

const EPSILON: f64 = 1e-7;

/// 集計済みの評価指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BinaryMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub auc: f64,
    pub samples: usize,
}

impl BinaryMetrics {
    pub fn compute(probabilities: &[f32], labels: &[f32]) -> Self {
        Self {
            loss: binary_cross_entropy(probabilities, labels),
            accuracy: accuracy(probabilities, labels),
            auc: roc_auc(probabilities, labels),
            samples: probabilities.len().min(labels.len()),
        }
    }
}

impl fmt::Display for BinaryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss={:.4} accuracy={:.4} auc={:.4} (n={})",
            self.loss, self.accuracy, self.auc, self.samples
        )
    }
}

/// 確率を [1e-7, 1-1e-7] に丸めた二値交差エントロピー
pub fn binary_cross_entropy(probabilities: &[f32], labels: &[f32]) -> f64 {
    let n = probabilities.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    let total: f64 = probabilities
        .iter()
        .zip(labels)
        .map(|(p, y)| {
            let p = (*p as f64).clamp(EPSILON, 1.0 - EPSILON);
            let y = *y as f64;
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum();
    total / n as f64
}

/// 正解率（p > 0.5 をクラス1とみなす）
pub fn accuracy(probabilities: &[f32], labels: &[f32]) -> f64 {
    let n = probabilities.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    let correct = probabilities
        .iter()
        .zip(labels)
        .filter(|(p, y)| (**p > 0.5) == (**y > 0.5))
        .count();
    correct as f64 / n as f64
}

/// ROC-AUC（Mann-Whitney U、同順位は平均順位）
///
/// 片方のクラスが存在しない場合は 0.5。
pub fn roc_auc(probabilities: &[f32], labels: &[f32]) -> f64 {
    let mut scored: Vec<(f32, bool)> = probabilities
        .iter()
        .zip(labels)
        .map(|(p, y)| (*p, *y > 0.5))
        .collect();
    let positives = scored.iter().filter(|(_, pos)| *pos).count();
    let negatives = scored.len() - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    scored.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut positive_rank_sum = 0.0f64;
    let mut i = 0;
    while i < scored.len() {
        let mut j = i;
        while j + 1 < scored.len() && scored[j + 1].0 == scored[i].0 {
            j += 1;
        }
        // 順位は1始まり
        let average_rank = (i + j) as f64 / 2.0 + 1.0;
        let tied_positives = scored[i..=j].iter().filter(|(_, pos)| *pos).count();
        positive_rank_sum += average_rank * tied_positives as f64;
        i = j + 1;
    }

    let p = positives as f64;
    let u = positive_rank_sum - p * (p + 1.0) / 2.0;
    u / (p * negatives as f64)
}

/// 2x2 混同行列（行 = 正解, 列 = 予測）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    counts: [[usize; 2]; 2],
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// p >= 0.5 をクラス1として集計
    pub fn from_predictions(probabilities: &[f32], labels: &[f32]) -> Self {
        let mut matrix = Self::new();
        for (p, y) in probabilities.iter().zip(labels) {
            let truth = usize::from(*y > 0.5);
            let predicted = usize::from(*p >= 0.5);
            matrix.record(truth, predicted);
        }
        matrix
    }

    pub fn record(&mut self, truth: usize, predicted: usize) {
        if truth < 2 && predicted < 2 {
            self.counts[truth][predicted] += 1;
        }
    }

    pub fn get(&self, truth: usize, predicted: usize) -> usize {
        self.counts
            .get(truth)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    pub fn counts(&self) -> [[usize; 2]; 2] {
        self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// クラス名付きの表として表示用文字列を作る
    pub fn render(&self, mapping: &ClassMapping) -> String {
        let name = |i: usize| mapping.name(i).unwrap_or("?").to_string();
        let width = mapping
            .names()
            .iter()
            .map(|n| n.len())
            .max()
            .unwrap_or(1)
            .max(6)
            + 2;
        let mut out = format!("{:>width$}", "true\\pred", width = width + 4);
        for col in 0..2 {
            out.push_str(&format!("{:>width$}", name(col), width = width));
        }
        out.push('\n');
        for row in 0..2 {
            out.push_str(&format!("{:>width$}", name(row), width = width + 4));
            for col in 0..2 {
                out.push_str(&format!("{:>width$}", self.counts[row][col], width = width));
            }
            out.push('\n');
        }
        out
    }

    /// CSVに書き出す（先頭列が正解クラス）
    pub fn write_csv(&self, path: &Path, mapping: &ClassMapping) -> Result<()> {
        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
        let header = ["true\\pred", mapping.name(0).unwrap_or("0"), mapping.name(1).unwrap_or("1")];
        writer.write_record(header).map_err(csv_error)?;
        for row in 0..2 {
            let label = mapping.name(row).unwrap_or("?").to_string();
            writer
                .write_record([
                    label,
                    self.counts[row][0].to_string(),
                    self.counts[row][1].to_string(),
                ])
                .map_err(csv_error)?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub(crate) fn csv_error(e: csv::Error) -> ClassifierError {
    ClassifierError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy_uses_strict_threshold() {
        let probs = [0.5, 0.9, 0.1, 0.6];
        let labels = [1.0, 1.0, 0.0, 0.0];
        // 0.5 はクラス0として扱われる
        assert!((accuracy(&probs, &labels) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_confusion_matrix_uses_inclusive_threshold() {
        let probs = [0.5, 0.9, 0.1, 0.6, 0.2];
        let labels = [1.0, 1.0, 0.0, 0.0, 1.0];
        let cm = ConfusionMatrix::from_predictions(&probs, &labels);
        assert_eq!(cm.counts(), [[1, 1], [1, 2]]);
        assert_eq!(cm.total(), 5);
        assert_eq!(cm.get(1, 1), 2);
        assert_eq!(cm.get(2, 0), 0);
    }

    #[test]
    fn test_auc_perfect_and_inverted() {
        let labels = [0.0, 0.0, 1.0, 1.0];
        assert!((roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels) - 1.0).abs() < 1e-9);
        assert!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels).abs() < 1e-9);
    }

    #[test]
    fn test_auc_ties_and_single_class() {
        let labels = [0.0, 1.0];
        assert!((roc_auc(&[0.5, 0.5], &labels) - 0.5).abs() < 1e-9);
        assert_eq!(roc_auc(&[0.2, 0.9], &[1.0, 1.0]), 0.5);

        // 正例(0.8, 0.4) 負例(0.4, 0.1): 勝ち 3 + 引き分け 0.5 = 3.5 / 4
        let auc = roc_auc(&[0.8, 0.4, 0.4, 0.1], &[1.0, 1.0, 0.0, 0.0]);
        assert!((auc - 0.875).abs() < 1e-9);
    }

    #[test]
    fn test_bce_clips_probabilities() {
        let loss = binary_cross_entropy(&[0.0], &[1.0]);
        assert!((loss - -(1e-7f64).ln()).abs() < 1e-6);
        let loss = binary_cross_entropy(&[0.5, 0.5], &[0.0, 1.0]);
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_confusion_matrix_csv_and_render() {
        let mapping = ClassMapping::new(vec!["cat".into(), "dog".into()]).unwrap();
        let cm = ConfusionMatrix::from_predictions(&[0.9, 0.1, 0.7], &[1.0, 0.0, 0.0]);
        let text = cm.render(&mapping);
        assert!(text.contains("cat"));
        assert!(text.contains("dog"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confusion_matrix.csv");
        cm.write_csv(&path, &mapping).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "true\\pred,cat,dog");
        assert_eq!(lines[1], "cat,1,1");
        assert_eq!(lines[2], "dog,0,1");
    }
}
