//! 提示词模板

use chrono::Utc;

use crate::flow::FeedbackEntry;
use crate::llm::Message;
use crate::novelty::{NoveltyAssessment, NoveltyScore};
use crate::research::types::{PlanRequest, QueryResults, QuerySummary, ResearchIdea};
use crate::retrieval::Reference;

const RESEARCHER: &str = "You are a careful research assistant. Be specific, factual and concise.";

/// 反馈日志中尚未解决的意见，按轮次列出
fn feedback_block(feedback: &[FeedbackEntry]) -> Option<String> {
    let open: Vec<String> = feedback
        .iter()
        .filter(|e| !e.approved && !e.feedback.is_empty())
        .map(|e| {
            let mut line = format!("- cycle {}: {}", e.cycle, e.feedback);
            if !e.areas_to_improve.is_empty() {
                line.push_str(&format!(" (areas: {})", e.areas_to_improve.join(", ")));
            }
            line
        })
        .collect();
    (!open.is_empty()).then(|| open.join("\n"))
}

pub fn query_generation(question: &str, num_queries: usize, feedback: &[FeedbackEntry]) -> Vec<Message> {
    let mut prompt = format!(
        "Current date: {}\n\nResearch question: {question}\n\n\
         Generate {num_queries} diverse web search queries that together gather the information \
         needed to answer the question. Each query should cover a different angle. For each query \
         give the query string and a one-sentence rationale.",
        Utc::now().format("%B %d, %Y")
    );
    if let Some(block) = feedback_block(feedback) {
        prompt.push_str(&format!(
            "\n\nThe reviewer asked for changes. Adjust the research focus accordingly:\n{block}"
        ));
    }
    vec![Message::system(RESEARCHER), Message::user(prompt)]
}

pub fn summarization(results: &QueryResults, top: usize) -> Vec<Message> {
    let content = results
        .hits
        .iter()
        .take(top)
        .map(|h| format!("Title: {}\nContent: {}", h.title, h.snippet))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");
    vec![
        Message::system(RESEARCHER),
        Message::user(format!(
            "Summarize the following search results for the query \"{}\".\n\
             Query rationale: {}\n\nSearch results:\n{content}\n\n\
             Give a concise summary of the key facts and themes relevant to the query.",
            results.query.query, results.query.rationale
        )),
    ]
}

pub fn idea_generation(
    question: &str,
    summaries: &[QuerySummary],
    feedback: &[FeedbackEntry],
) -> Vec<Message> {
    let gathered = summaries
        .iter()
        .map(|s| format!("Query: {}\nSummary: {}", s.query, s.summary))
        .collect::<Vec<_>>()
        .join("\n\n");
    let mut prompt = format!(
        "Research question: {question}\n\nGathered information:\n{gathered}\n\n\
         Propose a single, specific and actionable research idea that addresses the question and \
         builds on the gathered information. The description must be one sentence."
    );
    if let Some(block) = feedback_block(feedback) {
        prompt.push_str(&format!(
            "\n\nIncorporate this feedback on earlier versions of the idea:\n{block}"
        ));
    }
    vec![Message::system(RESEARCHER), Message::user(prompt)]
}

/// 自动评审：回复以 OK 开头表示通过，否则给出修改意见
pub fn idea_critique(question: &str, idea: &str) -> Vec<Message> {
    vec![
        Message::system(
            "You review research ideas. If the idea is specific, feasible and answers the question, \
             reply with exactly OK. Otherwise reply with one short paragraph describing what to change.",
        ),
        Message::user(format!("Question: {question}\n\nIdea:\n{idea}")),
    ]
}

pub fn plan_critique(plan: &str) -> Vec<Message> {
    vec![
        Message::system(
            "You review research plans. If the plan is coherent, realistic for its timeline and \
             covers risks, reply with exactly OK. Otherwise reply with one short paragraph naming \
             the sections to improve.",
        ),
        Message::user(plan.to_string()),
    ]
}

/// 新颖度文字评估：最相似的前 5 篇，摘要截到 600 字符
pub fn novelty_assessment(
    idea: &ResearchIdea,
    novelty: &NoveltyScore,
    references: &[Reference],
) -> Vec<Message> {
    let papers = references
        .iter()
        .take(5)
        .enumerate()
        .map(|(i, r)| {
            let mut abstract_text: String = r.abstract_text.chars().take(600).collect();
            if r.abstract_text.chars().count() > 600 {
                abstract_text.push_str("...");
            }
            let score = novelty
                .per_reference
                .iter()
                .find(|s| s.document_id == r.document_id)
                .map(|s| format!("{:.3}", s.novelty))
                .unwrap_or_else(|| "-".to_string());
            format!(
                "Paper {}:\nTitle: {}\nAbstract: {abstract_text}\nSimilarity: {:.3}\nNovelty: {score}",
                i + 1,
                r.title,
                r.similarity
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    vec![
        Message::system(
            "You assess how novel a research idea is against the most similar published papers. \
             Explain in one or two short paragraphs what the idea shares with the papers and what it \
             adds. End with a line of the form CONFIDENCE: <number between 0 and 1>.",
        ),
        Message::user(format!(
            "Research idea: {}\n{}\n\nOverall novelty score: {:.2}\n\nSimilar papers:\n{papers}",
            idea.title, idea.description, novelty.aggregate
        )),
    ]
}

pub fn plan_generation(
    idea: &ResearchIdea,
    novelty: &NoveltyScore,
    assessment: &NoveltyAssessment,
    references: &[Reference],
    request: &PlanRequest,
    feedback: &[FeedbackEntry],
) -> Vec<Message> {
    let related = references
        .iter()
        .take(5)
        .map(|r| format!("- {} (similarity {:.2})", r.title, r.similarity))
        .collect::<Vec<_>>()
        .join("\n");
    let constraints = if request.constraints.is_empty() {
        "none".to_string()
    } else {
        request.constraints.join("; ")
    };
    let mut prompt = format!(
        "Research idea: {}\n{}\n\nNovelty assessment: {}\n{}\n(confidence {:.2})\n\nMost similar existing work:\n{}\n\n\
         Project type: {}\nTimeline: {}\nTarget audience: {}\nConstraints: {constraints}\n\n\
         Write a complete research plan with numbered phases. Use the novelty assessment to position \
         the work against the similar papers.",
        idea.title,
        idea.description,
        novelty.summary(),
        assessment.summary,
        assessment.confidence,
        if related.is_empty() { "- none found".to_string() } else { related },
        request.project_type,
        request.timeline,
        request.target_audience,
    );
    if let Some(block) = feedback_block(feedback) {
        prompt.push_str(&format!("\n\nRevise the previous plan to address this feedback:\n{block}"));
    }
    vec![Message::system(RESEARCHER), Message::user(prompt)]
}

pub fn answer(question: &str) -> Vec<Message> {
    vec![Message::system(RESEARCHER), Message::user(question.to_string())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ValidationVerdict;
    use crate::research::types::{GeneratedIdea, Provenance};

    #[test]
    fn test_feedback_block_lists_open_items_only() {
        let log = vec![
            FeedbackEntry::from_verdict(1, &ValidationVerdict::rejected("narrow the scope")),
            FeedbackEntry::from_verdict(2, &ValidationVerdict::approved()),
        ];
        let block = feedback_block(&log).unwrap();
        assert_eq!(block, "- cycle 1: narrow the scope");
        assert!(feedback_block(&[]).is_none());
    }

    #[test]
    fn test_query_prompt_includes_feedback() {
        let log = vec![FeedbackEntry::from_verdict(
            1,
            &ValidationVerdict::rejected("focus on edge devices"),
        )];
        let messages = query_generation("q", 3, &log);
        assert!(messages[1].content.contains("focus on edge devices"));
        assert!(messages[1].content.contains("Generate 3"));
    }

    #[test]
    fn test_plan_prompt_carries_assessment_narrative() {
        let idea = ResearchIdea::new(
            GeneratedIdea {
                title: "Frugal inference".into(),
                description: "Adapt precision per layer to a power budget.".into(),
                rationale: String::new(),
            },
            Provenance::default(),
            0,
        );
        let novelty = NoveltyScore {
            idea_id: idea.id,
            per_reference: vec![],
            aggregate: 0.42,
            low_confidence: false,
            contributing: vec![],
            total_retrieved: 3,
            reranking_enabled: false,
        };
        let assessment = NoveltyAssessment {
            summary: "Prior work fixes one global precision.".into(),
            confidence: 0.75,
            llm_generated: true,
        };
        let request = PlanRequest {
            project_type: "general_research".into(),
            timeline: "3_months".into(),
            target_audience: "academic".into(),
            constraints: vec![],
        };
        let messages = plan_generation(&idea, &novelty, &assessment, &[], &request, &[]);
        let prompt = &messages[1].content;
        assert!(prompt.contains("Novelty 0.42 across 0 reference(s)"));
        assert!(prompt.contains("Prior work fixes one global precision."));
        assert!(prompt.contains("(confidence 0.75)"));
    }
}
