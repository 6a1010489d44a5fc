//! Ranking aggregation (C7): parses a chairman-style numbered ranking out of
//! free-form evaluator text, then aggregates parsed rankings across
//! evaluators into an average rank per model.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

fn final_ranking_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\d+\.\s*(Response [A-Z])\s*$").unwrap())
}

fn response_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Response [A-Z]").unwrap())
}

/// `ParseRanking(text) → list<label>` (§4.7).
///
/// Strategy, in order:
/// 1. Find a line starting with `FINAL RANKING`; read numbered `Response X`
///    lines after it until a non-empty, non-matching line.
/// 2. If that yields nothing, scan the whole `FINAL RANKING` section for any
///    `Response X` occurrence, in order.
/// 3. If there was no `FINAL RANKING` section at all, scan the entire text
///    for `Response X` occurrences, in order.
pub fn parse_ranking(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let section_start = lines
        .iter()
        .position(|line| line.trim_start().starts_with("FINAL RANKING"));

    let Some(start) = section_start else {
        return response_label_re()
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect();
    };

    let mut matched = Vec::new();
    for line in &lines[start + 1..] {
        if let Some(caps) = final_ranking_line_re().captures(line) {
            matched.push(caps[1].to_string());
        } else if line.trim().is_empty() {
            continue;
        } else {
            break;
        }
    }
    if !matched.is_empty() {
        return matched;
    }

    let section_text = lines[start..].join("\n");
    response_label_re()
        .find_iter(&section_text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Assigns labels `Response A`, `Response B`, ... to models in the order
/// given, which the caller always derives from the successful Stage 1
/// results so the mapping is stable for the lifetime of one execution.
pub fn build_label_to_model(models_in_order: &[String]) -> HashMap<String, String> {
    models_in_order
        .iter()
        .enumerate()
        .map(|(i, model)| {
            let letter = (b'A' + i as u8) as char;
            (format!("Response {letter}"), model.clone())
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateRanking {
    pub model: String,
    #[serde(rename = "averageRank")]
    pub average_rank: f64,
    #[serde(rename = "rankingsCount")]
    pub rankings_count: usize,
}

/// `AggregateRankings(rankings, labelToModel) → list<AggregateRanking>`
/// (§4.7). `rankings` is one parsed ranking (ordered labels, best first) per
/// evaluator. Average rank is `sum(positions) / count`, rounded to 2
/// decimals; ties are broken by the order models first appear across the
/// evaluators (a stable sort preserves this since it never reorders equal
/// keys).
pub fn aggregate_rankings(
    rankings: &[Vec<String>],
    label_to_model: &HashMap<String, String>,
) -> Vec<AggregateRanking> {
    let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
    let mut insertion_order: Vec<String> = Vec::new();

    for parsed in rankings {
        for (index, label) in parsed.iter().enumerate() {
            let Some(model) = label_to_model.get(label) else {
                continue;
            };
            let entry = positions.entry(model.clone()).or_insert_with(|| {
                insertion_order.push(model.clone());
                Vec::new()
            });
            entry.push(index + 1);
        }
    }

    let mut out: Vec<AggregateRanking> = insertion_order
        .into_iter()
        .map(|model| {
            let positions = &positions[&model];
            let sum: usize = positions.iter().sum();
            let average = (sum as f64 / positions.len() as f64 * 100.0).round() / 100.0;
            AggregateRanking {
                model,
                average_rank: average,
                rankings_count: positions.len(),
            }
        })
        .collect();

    out.sort_by(|a, b| a.average_rank.partial_cmp(&b.average_rank).unwrap());
    out
}
