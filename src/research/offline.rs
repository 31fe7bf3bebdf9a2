//! 离线协作方：未配置 API Key 时使用，整条流水线可在本地跑通

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{MockEmbedder, MockLlmClient};
use crate::retrieval::{IndexedDocument, InMemoryIndex};
use crate::search::{SearchError, SearchHit, WebSearch};

const PAPERS: &[(&str, &str, &str)] = &[
    (
        "offline-0001",
        "Mixed-precision inference on commodity GPUs",
        "We study power and latency of int8 and fp16 inference kernels on consumer GPUs.",
    ),
    (
        "offline-0002",
        "Approximate computing for neural network accelerators",
        "Approximate arithmetic units trade accuracy for energy in inference accelerators.",
    ),
    (
        "offline-0003",
        "Retrieval-augmented literature review assistants",
        "Language models with retrieval summarise related work and flag overlapping research.",
    ),
    (
        "offline-0004",
        "Energy-aware scheduling of deep learning workloads",
        "Scheduling deep learning jobs across data-centre GPUs to reduce total power draw.",
    ),
];

fn idea_json() -> String {
    json!({
        "title": "Energy-proportional low-precision inference",
        "description": "Reduce GPU power draw by switching inference precision per layer according to measured sensitivity.",
        "rationale": "Existing work fixes precision globally; per-layer switching is largely unexplored."
    })
    .to_string()
}

fn queries_json() -> String {
    json!({
        "queries": [
            {"query": "low precision inference GPU power", "rationale": "Measure the energy side of quantization."},
            {"query": "per-layer mixed precision sensitivity", "rationale": "Find how layers tolerate precision loss."},
            {"query": "approximate computing accelerators energy", "rationale": "Related hardware approaches."}
        ]
    })
    .to_string()
}

fn plan_json() -> String {
    json!({
        "title": "Energy-Proportional Low-Precision Inference",
        "executive_summary": "A three-phase study of per-layer precision switching to cut GPU inference power.",
        "objective": "Quantify power savings and accuracy cost of per-layer precision selection.",
        "timeline": "12 weeks",
        "methodology": "Profile layer sensitivity, implement a precision controller, benchmark power and accuracy.",
        "phases": [
            {"number": 1, "title": "Sensitivity profiling", "duration": "3 weeks",
             "tasks": ["Select benchmark models", "Measure per-layer error under int8 and fp16"],
             "deliverables": ["Sensitivity report"]},
            {"number": 2, "title": "Precision controller", "duration": "5 weeks",
             "tasks": ["Implement runtime switching", "Integrate power telemetry"],
             "deliverables": ["Prototype controller"]},
            {"number": 3, "title": "Evaluation", "duration": "4 weeks",
             "tasks": ["Benchmark power and accuracy", "Compare with static quantization"],
             "deliverables": ["Evaluation report", "Paper draft"]}
        ],
        "risks": ["Telemetry resolution too coarse", "Switching overhead exceeds savings"],
        "resources": ["Two consumer GPUs", "Power meter"],
        "success_metrics": ["At least 15% power reduction", "Under 1% accuracy loss"]
    })
    .to_string()
}

/// 按提示词关键字给出固定回复的模型
pub fn offline_llm() -> MockLlmClient {
    MockLlmClient::new()
        .with_rule("You review research ideas", "OK")
        .with_rule("You review research plans", "OK")
        .with_rule(
            "You assess how novel a research idea is",
            "The closest papers lower precision globally to save energy. Choosing precision per layer \
             against an explicit power budget is not covered by them.\nCONFIDENCE: 0.75",
        )
        .with_rule("diverse web search queries", queries_json())
        .with_rule("Propose a single", idea_json())
        .with_rule("Write a complete research plan", plan_json())
        .with_rule(
            "Summarize the following search results",
            "Prior work reports large energy savings from reduced precision, mostly with a single global precision setting.",
        )
}

/// 每个查询返回两条固定结果
#[derive(Debug, Default)]
pub struct OfflineSearch;

#[async_trait]
impl WebSearch for OfflineSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        Ok(PAPERS
            .iter()
            .take(2)
            .map(|(id, title, abstract_text)| SearchHit {
                title: format!("{title} ({query})"),
                snippet: abstract_text.to_string(),
                url: format!("https://example.org/{id}"),
            })
            .collect())
    }
}

/// 用同一个 MockEmbedder 编码的小型文献库，维度与查询向量一致
pub fn offline_index(embedder: &MockEmbedder) -> InMemoryIndex {
    PAPERS
        .iter()
        .map(|(id, title, abstract_text)| {
            IndexedDocument::new(
                *id,
                vec![embedder.embed_text(title), embedder.embed_text(abstract_text)],
            )
            .with_metadata("title", *title)
            .with_metadata("abstract", *abstract_text)
        })
        .collect()
}
