//! Flow 类型定义
//!
//! 字段键（带类型的 Field<T>）、分支判别值（Discriminant）、校验结论与反馈日志

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type NodeId = String;

/// Context 中的一个命名字段，值类型在编译期固定
pub struct Field<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Field<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field({})", self.name)
    }
}

/// 节点分支所依据的封闭枚举；构图时按 variants() 检查边是否穷尽
pub trait Discriminant: Serialize + DeserializeOwned + Copy + Send + Sync + 'static {
    fn variants() -> &'static [Self];

    fn label(&self) -> &'static str;
}

/// 从 Context 中的原始值解析出判别标签（构图时以函数指针形式保存）
pub(crate) fn resolve_label<D: Discriminant>(value: &Value) -> Option<&'static str> {
    serde_json::from_value::<D>(value.clone())
        .ok()
        .map(|d| d.label())
}

/// 校验结论：通过，或附带反馈的驳回
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationVerdict {
    Approved {
        #[serde(default)]
        feedback: String,
    },
    Rejected {
        feedback: String,
        #[serde(default)]
        areas_to_improve: Vec<String>,
    },
}

impl ValidationVerdict {
    pub fn approved() -> Self {
        ValidationVerdict::Approved {
            feedback: String::new(),
        }
    }

    pub fn rejected(feedback: impl Into<String>) -> Self {
        ValidationVerdict::Rejected {
            feedback: feedback.into(),
            areas_to_improve: Vec::new(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ValidationVerdict::Approved { .. })
    }

    pub fn feedback(&self) -> &str {
        match self {
            ValidationVerdict::Approved { feedback } | ValidationVerdict::Rejected { feedback, .. } => {
                feedback
            }
        }
    }
}

/// 反馈日志条目（只追加，不擦除）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub cycle: u32,
    pub approved: bool,
    pub feedback: String,
    #[serde(default)]
    pub areas_to_improve: Vec<String>,
}

impl FeedbackEntry {
    pub fn from_verdict(cycle: u32, verdict: &ValidationVerdict) -> Self {
        let areas_to_improve = match verdict {
            ValidationVerdict::Rejected {
                areas_to_improve, ..
            } => areas_to_improve.clone(),
            ValidationVerdict::Approved { .. } => Vec::new(),
        };
        Self {
            cycle,
            approved: verdict.is_approved(),
            feedback: verdict.feedback().to_string(),
            areas_to_improve,
        }
    }
}

/// 校验循环的终态，作为节点的分支判别字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Approved,
    Exhausted,
}

impl Discriminant for LoopStatus {
    fn variants() -> &'static [Self] {
        &[LoopStatus::Approved, LoopStatus::Exhausted]
    }

    fn label(&self) -> &'static str {
        match self {
            LoopStatus::Approved => "approved",
            LoopStatus::Exhausted => "exhausted",
        }
    }
}

/// 校验循环耗尽后由图决定继续（尽力而为的产物）还是中止整次运行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    #[default]
    Proceed,
    Abort,
}
