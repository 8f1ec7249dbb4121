//! Tool filtering
//!
//! Two passes run on every server's tools: a global denylist of tools known
//! to break the execution engine, then the agent's own allow-list.

use super::types::ToolRef;

/// Minimum normalized Levenshtein similarity for a "did you mean" suggestion
const SUGGESTION_CUTOFF: f64 = 0.4;

/// Maximum suggestions per requested name
const MAX_SUGGESTIONS: usize = 3;

/// Remove tools whose name is on the denylist
pub fn filter_denylisted(tools: Vec<ToolRef>, denylist: &[String]) -> Vec<ToolRef> {
    let before = tools.len();
    let kept: Vec<ToolRef> = tools
        .into_iter()
        .filter(|tool| {
            let denied = denylist.iter().any(|name| *name == tool.name);
            if denied {
                tracing::warn!("Removing denylisted tool '{}' from '{}'", tool.name, tool.server);
            }
            !denied
        })
        .collect();

    let removed = before - kept.len();
    if removed > 0 {
        tracing::warn!("Removed {} denylisted tool(s)", removed);
    }
    kept
}

/// Whether `tool_name` satisfies the requested name `wanted`
///
/// Matches exactly, case-insensitively, or as a namespaced suffix
/// (`w/workspace/script` matches `script`).
fn matches_request(tool_name: &str, wanted: &str) -> bool {
    tool_name == wanted
        || tool_name.to_lowercase() == wanted.to_lowercase()
        || tool_name.ends_with(&format!("/{}", wanted))
}

/// Keep only the tools the agent asked for
///
/// An empty `allowed` list means no restriction. When nothing matches a
/// non-empty tool list, close names are suggested in the log.
pub fn filter_by_allowlist(tools: Vec<ToolRef>, allowed: &[String]) -> Vec<ToolRef> {
    if allowed.is_empty() {
        return tools;
    }

    let available: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
    let kept: Vec<ToolRef> = tools
        .into_iter()
        .filter(|tool| allowed.iter().any(|wanted| matches_request(&tool.name, wanted)))
        .collect();

    if kept.is_empty() && !available.is_empty() {
        tracing::warn!("No tools matched! Requested {} tools: {:?}", allowed.len(), allowed);
        for wanted in allowed {
            let close = suggestions(wanted, &available);
            if !close.is_empty() {
                tracing::warn!("Did you mean one of these for '{}'? {:?}", wanted, close);
            }
        }
        tracing::warn!("All {} available tools: {:?}", available.len(), available);
    }

    kept
}

/// Up to three names from `candidates` close to `wanted`, best first
pub fn suggestions(wanted: &str, candidates: &[String]) -> Vec<String> {
    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .map(|candidate| (strsim::normalized_levenshtein(wanted, candidate), candidate))
        .filter(|(score, _)| *score >= SUGGESTION_CUTOFF)
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, name)| name.clone())
        .collect()
}
