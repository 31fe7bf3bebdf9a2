//! 新颖度打分与聚合
//!
//! 单篇新颖度是相似度的单调不增函数，取值 [0, 1]；聚合取算术平均，
//! 先排序再求和，保证同一组分数无论顺序如何结果逐位一致。
//! 参考文献为空时聚合为 1.0 并标记低置信度。

use serde::{Deserialize, Serialize};

/// 相似度到新颖度的映射
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoringFunction {
    /// 1 - similarity
    #[default]
    Linear,
    /// (1 - similarity)^gamma，gamma > 1 时对高相似度惩罚更重
    Power { gamma: f64 },
}

impl ScoringFunction {
    pub fn novelty(&self, similarity: f64) -> f64 {
        let distance = 1.0 - similarity.clamp(0.0, 1.0);
        let score = match self {
            ScoringFunction::Linear => distance,
            ScoringFunction::Power { gamma } => distance.powf(gamma.max(0.0)),
        };
        score.clamp(0.0, 1.0)
    }
}

/// 聚合结果：(平均新颖度, 是否低置信度)
pub fn aggregate(scores: &[f64]) -> (f64, bool) {
    if scores.is_empty() {
        return (1.0, true);
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    (mean, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_linear_bounds() {
        let f = ScoringFunction::Linear;
        assert_eq!(f.novelty(1.0), 0.0);
        assert_eq!(f.novelty(0.0), 1.0);
        assert_eq!(f.novelty(1.3), 0.0);
        assert_eq!(f.novelty(-0.2), 1.0);
    }

    #[test]
    fn test_scoring_is_monotone_non_increasing() {
        for f in [
            ScoringFunction::Linear,
            ScoringFunction::Power { gamma: 2.0 },
            ScoringFunction::Power { gamma: 0.5 },
        ] {
            let mut previous = f64::INFINITY;
            for step in 0..=100 {
                let score = f.novelty(step as f64 / 100.0);
                assert!(score <= previous, "{f:?} increased at step {step}");
                assert!((0.0..=1.0).contains(&score));
                previous = score;
            }
        }
    }

    #[test]
    fn test_reference_scenario() {
        let f = ScoringFunction::Linear;
        let scores: Vec<f64> = [0.92, 0.81, 0.40].iter().map(|s| f.novelty(*s)).collect();
        for (got, want) in scores.iter().zip([0.08, 0.19, 0.60]) {
            assert!((got - want).abs() < EPS);
        }
        let (mean, low_confidence) = aggregate(&scores);
        assert!((mean - 0.29).abs() < EPS);
        assert!(!low_confidence);
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let a = aggregate(&[0.1, 0.7, 0.33, 0.9, 0.05]);
        let b = aggregate(&[0.9, 0.05, 0.7, 0.1, 0.33]);
        assert_eq!(a.0.to_bits(), b.0.to_bits());
    }

    #[test]
    fn test_empty_is_max_novelty_low_confidence() {
        assert_eq!(aggregate(&[]), (1.0, true));
    }

    #[test]
    fn test_scoring_config_shape() {
        let f: ScoringFunction = serde_json::from_str(r#"{"kind": "power", "gamma": 2.0}"#).unwrap();
        assert_eq!(f, ScoringFunction::Power { gamma: 2.0 });
        let f: ScoringFunction = serde_json::from_str(r#"{"kind": "linear"}"#).unwrap();
        assert_eq!(f, ScoringFunction::Linear);
    }
}
