use serde::Deserialize;

/// Parsed form of a Vision Adapter reply (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictStatus {
    /// The condition is confirmed.
    Resolved,
    /// The condition does not yet hold.
    Watching,
}

/// A verdict: a status plus a short human-readable detail for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the condition is confirmed.
    pub status: VerdictStatus,
    /// Human-readable detail, truncated to 200 characters.
    pub detail: String,
}

const DETAIL_MAX: usize = 200;
const MARKER: &str = "FINAL_JSON:";

#[derive(Debug, Deserialize)]
struct FinalJson {
    decision: Option<String>,
    summary: Option<String>,
}

/// Parse a free-form Vision Adapter reply into a [`Verdict`]. Never panics
/// or returns an error — malformed input falls through to `Watching` with
/// the reply text as detail (§4.3).
pub fn parse_verdict(reply: &str) -> Verdict {
    if let Some(verdict) = parse_final_json(reply) {
        return verdict;
    }

    let trimmed = reply.trim_start();
    if starts_with_yes(trimmed) {
        let rest = trimmed[3..].trim_start().trim_start_matches(':').trim_start();
        return Verdict {
            status: VerdictStatus::Resolved,
            detail: truncate(rest),
        };
    }

    Verdict {
        status: VerdictStatus::Watching,
        detail: truncate(reply.trim()),
    }
}

fn starts_with_yes(trimmed: &str) -> bool {
    trimmed.len() >= 3 && trimmed.as_bytes()[..3].eq_ignore_ascii_case(b"YES")
}

fn parse_final_json(reply: &str) -> Option<Verdict> {
    let idx = reply.find(MARKER)?;
    let after = &reply[idx + MARKER.len()..];
    // The marker may be followed by trailing text after the JSON object;
    // take only the first complete JSON value.
    let value = serde_json::Deserializer::from_str(after)
        .into_iter::<FinalJson>()
        .next()?
        .ok()?;

    let status = match value.decision.as_deref() {
        Some(d) if d.eq_ignore_ascii_case("resolved") => VerdictStatus::Resolved,
        _ => VerdictStatus::Watching,
    };
    let detail = value
        .summary
        .unwrap_or_else(|| truncate(reply));
    Some(Verdict {
        status,
        detail: truncate(&detail),
    })
}

fn truncate(s: &str) -> String {
    if s.len() <= DETAIL_MAX {
        return s.to_string();
    }
    match s.char_indices().nth(DETAIL_MAX) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}
