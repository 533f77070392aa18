//! クラスインデックスとクラス名の対応表
//!
//! 学習時にデータセットのディレクトリ名（ソート順）から作成し、
//! モデルファイルの metadata.json に保存します。推論時はこの保存済みの
//! 対応表を使い、ハードコードされたラベルは使いません。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ClassifierError, Result};

/// 現在の対応表フォーマットのバージョン
pub const CLASS_MAPPING_VERSION: u32 = 1;

/// インデックス -> クラス名の順序付き対応表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMapping {
    version: u32,
    classes: Vec<String>,
}

impl ClassMapping {
    /// クラス名の並びから対応表を作成（並び順がそのままインデックスになる）
    pub fn new(classes: Vec<String>) -> Result<Self> {
        let mapping = Self {
            version: CLASS_MAPPING_VERSION,
            classes,
        };
        mapping.check()?;
        Ok(mapping)
    }

    /// ディレクトリ名から対応表を作成（名前順にソート）
    pub fn from_directory_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut classes: Vec<String> = names.into_iter().map(Into::into).collect();
        classes.sort();
        Self::new(classes)
    }

    fn check(&self) -> Result<()> {
        if self.version != CLASS_MAPPING_VERSION {
            return Err(ClassifierError::ClassMapping(format!(
                "unsupported mapping version {} (expected {})",
                self.version, CLASS_MAPPING_VERSION
            )));
        }
        if self.classes.len() < 2 {
            return Err(ClassifierError::ClassMapping(format!(
                "at least 2 classes are required, got {:?}",
                self.classes
            )));
        }
        for (i, name) in self.classes.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(ClassifierError::ClassMapping(format!(
                    "class name at index {} is empty",
                    i
                )));
            }
            if self.classes[..i].contains(name) {
                return Err(ClassifierError::ClassMapping(format!(
                    "duplicate class name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// デシリアライズ後の検証
    pub fn validate(&self) -> Result<()> {
        self.check()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.classes
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|c| c == name)
    }

    /// `{"0": "cat", "1": "dog"}` 形式の表現
    pub fn to_index_map(&self) -> BTreeMap<String, String> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, name)| (i.to_string(), name.clone()))
            .collect()
    }

    /// モデル出力ユニット数との整合性を検証する
    ///
    /// シグモイド1ユニットは2クラス、それ以外はユニット数とクラス数が一致する必要がある。
    pub fn validate_output_units(&self, units: usize) -> Result<()> {
        let ok = match units {
            1 => self.classes.len() == 2,
            n => n == self.classes.len(),
        };
        if ok {
            Ok(())
        } else {
            Err(ClassifierError::ClassMapping(format!(
                "model has {} output unit(s) but the mapping holds {} classes",
                units,
                self.classes.len()
            )))
        }
    }

    /// インデックス0と1を入れ替えた対応表
    pub fn swapped(&self) -> Self {
        let mut classes = self.classes.clone();
        if classes.len() >= 2 {
            classes.swap(0, 1);
        }
        Self {
            version: self.version,
            classes,
        }
    }

    /// 別の対応表（例: データセットを再スキャンした結果）と一致するか検証する
    pub fn verify_against(&self, other: &ClassMapping) -> Result<()> {
        if self.classes == other.classes {
            Ok(())
        } else {
            Err(ClassifierError::ClassMapping(format!(
                "persisted mapping {:?} does not match {:?}",
                self.classes, other.classes
            )))
        }
    }
}
