//! The context compaction engine (C2, SPEC_FULL §4.2).
//!
//! Every function here is pure: given an entry list (and, for `compact`, a
//! caller-supplied summary generator closure) they return a value with no
//! side effects. The cut-point/partition math never looks at anything a
//! before/after hook could have patched — hook patches apply only to the
//! prompt text handed to the summary generator (SPEC_FULL §9 ambiguity a),
//! which is why `compact` takes the prepared partition as an already-fixed
//! input rather than recomputing it.

use tabline_core::{CompactionReason, Entry, EntryBody, EntryId, Role};

/// 4 characters ≈ 1 token. Matches this workspace's existing context
/// manager approximation, generalized from "whole conversation" to "any
/// entry text".
const CHARS_PER_TOKEN: f64 = 4.0;

pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() as f64) / CHARS_PER_TOKEN).ceil() as u64
}

fn entry_tokens(e: &Entry) -> u64 {
    // +10 for role/structure overhead, matching this workspace's existing
    // per-message overhead constant.
    estimate_tokens(e.body.text()) + 10
}

fn total_tokens(entries: &[Entry]) -> u64 {
    entries.iter().map(entry_tokens).sum()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShouldCompactReason {
    Overflow,
    Threshold,
}

#[derive(Debug, Clone)]
pub struct ShouldCompactResult {
    pub should_compact: bool,
    pub reason: Option<ShouldCompactReason>,
    pub tokens_before: u64,
}

/// `shouldCompact({overflow, entries, previousSummary, thresholdTokens})`.
/// `previous_summary` only affects the token count (it is itself an entry's
/// text in practice, but callers that track it separately from the entry
/// list can pass it here too) — it does not gate the decision on its own.
pub fn should_compact(
    overflow: bool,
    entries: &[Entry],
    previous_summary: Option<&str>,
    threshold_tokens: u64,
) -> ShouldCompactResult {
    let mut tokens_before = total_tokens(entries);
    if let Some(s) = previous_summary {
        tokens_before += estimate_tokens(s);
    }

    if overflow {
        return ShouldCompactResult {
            should_compact: true,
            reason: Some(ShouldCompactReason::Overflow),
            tokens_before,
        };
    }
    if tokens_before >= threshold_tokens {
        return ShouldCompactResult {
            should_compact: true,
            reason: Some(ShouldCompactReason::Threshold),
            tokens_before,
        };
    }
    ShouldCompactResult {
        should_compact: false,
        reason: None,
        tokens_before,
    }
}

#[derive(Debug, Clone)]
pub struct CutPoint {
    /// Index (within the slice passed in) of the first entry to keep
    /// verbatim. Entries before this index are candidates for
    /// summarization. `0` means "nothing to cut" (not enough history to
    /// summarize).
    pub cut_index: usize,
    /// Set when the cut point falls mid-turn and `split_turn` was
    /// requested: the index of the turn-start boundary at or before
    /// `cut_index`.
    pub turn_start_index: Option<usize>,
    pub is_split: bool,
}

/// `findCutPoint({entries, keepTail?, splitTurn?})`.
///
/// Starting from the end, accumulates token estimates until the tail budget
/// `keep_recent_tokens` is reached, then walks further back (if needed) to
/// the nearest entry that is a *valid* cut point (not `tool`,
/// `branch_summary`, or `custom_message`). If that point is not itself a
/// turn boundary (`user`/`system` message) and `split_turn` is set, the
/// turn-start index is also located and the result is marked split.
pub fn find_cut_point(entries: &[Entry], keep_recent_tokens: u64, split_turn: bool) -> CutPoint {
    let n = entries.len();
    if n == 0 {
        return CutPoint {
            cut_index: 0,
            turn_start_index: None,
            is_split: false,
        };
    }

    let mut accumulated = 0u64;
    // Default: no valid cut point found within the window, so there is
    // nothing old enough to summarize — keep the whole window (mirrors the
    // `cut_index == 0` "nothing to cut" case `prepare_compaction` already
    // treats as a no-op).
    let mut cut_index = 0;

    for i in (0..n).rev() {
        accumulated += entry_tokens(&entries[i]);
        if accumulated >= keep_recent_tokens && entries[i].body.is_valid_cut_point() {
            cut_index = i;
            break;
        }
    }

    if cut_index == 0 || cut_index >= n {
        return CutPoint {
            cut_index,
            turn_start_index: None,
            is_split: false,
        };
    }

    if entries[cut_index].body.is_turn_boundary() {
        return CutPoint {
            cut_index,
            turn_start_index: None,
            is_split: false,
        };
    }

    if !split_turn {
        return CutPoint {
            cut_index,
            turn_start_index: None,
            is_split: false,
        };
    }

    let mut turn_start = cut_index;
    while turn_start > 0 && !entries[turn_start].body.is_turn_boundary() {
        turn_start -= 1;
    }
    CutPoint {
        cut_index,
        turn_start_index: Some(turn_start),
        is_split: true,
    }
}

#[derive(Debug, Clone)]
pub struct PreparedCompaction {
    pub dropped: Vec<Entry>,
    pub kept: Vec<Entry>,
    pub messages_to_summarize: Vec<Entry>,
    pub turn_prefix_messages: Vec<Entry>,
    pub is_split_turn: bool,
    pub first_kept_entry_id: EntryId,
    pub tokens_before: u64,
}

/// `prepareCompaction(...)`. Ignores entries before the last existing
/// compaction record, finds a cut point within the remaining window, and
/// partitions into `{dropped, kept}` plus the two summarization slices.
pub fn prepare_compaction(
    entries: &[Entry],
    keep_recent_tokens: u64,
    split_turn: bool,
) -> Option<PreparedCompaction> {
    let window_start = entries
        .iter()
        .rposition(|e| matches!(e.body, EntryBody::Compaction { .. }))
        .map(|idx| idx + 1)
        .unwrap_or(0);
    let window = &entries[window_start..];
    if window.is_empty() {
        return None;
    }

    let cut = find_cut_point(window, keep_recent_tokens, split_turn);
    if cut.cut_index == 0 {
        // nothing before the cut point to summarize
        return None;
    }

    let dropped: Vec<Entry> = entries[..window_start]
        .iter()
        .cloned()
        .chain(window[..cut.cut_index].iter().cloned())
        .collect();
    let kept: Vec<Entry> = window[cut.cut_index..].to_vec();

    let turn_prefix_start = cut.turn_start_index.unwrap_or(cut.cut_index);
    let turn_prefix_messages = if cut.is_split {
        window[turn_prefix_start..cut.cut_index].to_vec()
    } else {
        Vec::new()
    };
    let messages_to_summarize = window[..turn_prefix_start.min(cut.cut_index)].to_vec();

    let first_kept_entry_id = kept
        .first()
        .map(|e| e.id.clone())
        .unwrap_or_else(|| window[cut.cut_index].id.clone());

    Some(PreparedCompaction {
        dropped,
        kept,
        messages_to_summarize,
        turn_prefix_messages,
        is_split_turn: cut.is_split,
        first_kept_entry_id,
        tokens_before: total_tokens(entries),
    })
}

const SPLIT_TURN_DELIMITER: &str = "Turn Context (split turn):";

fn render_conversation(entries: &[Entry]) -> String {
    entries
        .iter()
        .map(|e| e.body.text().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fixed summarization prompt template with `<conversation>` and
/// `<previous-summary>` slots (SPEC_FULL §4.2).
pub fn history_summary_prompt(
    messages: &[Entry],
    previous_summary: Option<&str>,
    custom_instructions: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if let Some(prev) = previous_summary {
        prompt.push_str("<previous-summary>\n");
        prompt.push_str(prev);
        prompt.push_str("\n</previous-summary>\n\n");
    }
    prompt.push_str("<conversation>\n");
    prompt.push_str(&render_conversation(messages));
    prompt.push_str("\n</conversation>\n\n");
    prompt.push_str("Summarize the conversation above, preserving task-relevant detail.");
    if let Some(custom) = custom_instructions {
        prompt.push('\n');
        prompt.push_str(custom);
    }
    prompt
}

pub fn turn_prefix_summary_prompt(turn_prefix: &[Entry]) -> String {
    format!(
        "<conversation>\n{}\n</conversation>\n\nSummarize this partial turn so a continuation \
         can pick it up without the original messages.",
        render_conversation(turn_prefix)
    )
}

/// Extract `<read-files>`/`<modified-files>` sections from tool-call entries
/// among `messages`: `read` tool calls contribute to read-files, `write`/
/// `edit` contribute to modified-files. Paths are looked up in each tool
/// entry's `tool_name` plus its text, which is expected to carry the
/// resolved path as the first line (the loop controller is responsible for
/// shaping tool-result entries this way).
fn extract_file_sections(messages: &[Entry]) -> Option<String> {
    let mut read_files = Vec::new();
    let mut modified_files = Vec::new();
    for entry in messages {
        if let EntryBody::Message {
            role: Role::Tool,
            tool_name: Some(name),
            text,
            ..
        } = &entry.body
        {
            let path = text.lines().next().unwrap_or("").trim();
            if path.is_empty() {
                continue;
            }
            match name.as_str() {
                "read" | "read_file" => read_files.push(path.to_string()),
                "write" | "write_file" | "edit" | "edit_file" => {
                    modified_files.push(path.to_string())
                }
                _ => {}
            }
        }
    }
    if read_files.is_empty() && modified_files.is_empty() {
        return None;
    }
    let mut out = String::new();
    if !read_files.is_empty() {
        read_files.sort();
        read_files.dedup();
        out.push_str("<read-files>\n");
        out.push_str(&read_files.join("\n"));
        out.push_str("\n</read-files>\n");
    }
    if !modified_files.is_empty() {
        modified_files.sort();
        modified_files.dedup();
        out.push_str("<modified-files>\n");
        out.push_str(&modified_files.join("\n"));
        out.push_str("\n</modified-files>\n");
    }
    Some(out)
}

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub body: EntryBody,
    pub tokens_after: u64,
}

/// `compact(preparation, summaryGenerator, customInstructions?)`.
///
/// `history_summary` is the already-produced summary for
/// `prepared.messages_to_summarize` (a history summary is always
/// generated); `turn_prefix_summary` must be `Some` iff
/// `prepared.is_split_turn`.
pub fn compact(
    prepared: &PreparedCompaction,
    previous_summary: Option<&str>,
    history_summary: &str,
    turn_prefix_summary: Option<&str>,
    reason: CompactionReason,
) -> CompactionOutcome {
    let mut summary = history_summary.to_string();
    if let Some(turn_prefix) = turn_prefix_summary {
        summary.push_str("\n\n");
        summary.push_str(SPLIT_TURN_DELIMITER);
        summary.push('\n');
        summary.push_str(turn_prefix);
    }
    if let Some(sections) = extract_file_sections(&prepared.messages_to_summarize) {
        summary.push('\n');
        summary.push_str(&sections);
    }

    let tokens_after = estimate_tokens(&summary) + total_tokens(&prepared.kept);

    let body = EntryBody::Compaction {
        reason,
        summary,
        previous_summary: previous_summary.map(|s| s.to_string()),
        first_kept_entry_id: prepared.first_kept_entry_id.clone(),
        tokens_before: prepared.tokens_before,
        tokens_after,
    };

    CompactionOutcome { body, tokens_after }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabline_core::{Entry, EntryBody, Role};

    fn msg(role: Role, text: &str) -> Entry {
        Entry::new(None, EntryBody::Message {
            role,
            text: text.to_string(),
            tool_name: None,
            tool_call_id: None,
        })
    }

    fn chain(entries: Vec<Entry>) -> Vec<Entry> {
        let mut out = Vec::with_capacity(entries.len());
        let mut parent = None;
        for mut e in entries {
            e.parent_id = parent.clone();
            parent = Some(e.id.clone());
            out.push(e);
        }
        out
    }

    #[test]
    fn should_compact_overflow_wins_regardless_of_tokens() {
        let entries = chain(vec![msg(Role::User, "hi")]);
        let r = should_compact(true, &entries, None, 1_000_000);
        assert!(r.should_compact);
        assert_eq!(r.reason, Some(ShouldCompactReason::Overflow));
    }

    #[test]
    fn should_compact_threshold() {
        let entries = chain(vec![msg(Role::User, &"x".repeat(4000))]);
        let r = should_compact(false, &entries, None, 500);
        assert!(r.should_compact);
        assert_eq!(r.reason, Some(ShouldCompactReason::Threshold));
    }

    #[test]
    fn should_compact_false_under_threshold() {
        let entries = chain(vec![msg(Role::User, "hi")]);
        let r = should_compact(false, &entries, None, 1_000_000);
        assert!(!r.should_compact);
        assert!(r.reason.is_none());
    }

    #[test]
    fn tokens_after_never_exceeds_tokens_before() {
        let entries = chain(vec![
            msg(Role::User, &"a".repeat(2000)),
            msg(Role::Assistant, &"b".repeat(2000)),
            msg(Role::User, &"c".repeat(2000)),
            msg(Role::Assistant, &"d".repeat(2000)),
        ]);
        let prepared = prepare_compaction(&entries, 50, true).expect("should prepare");
        let outcome = compact(
            &prepared,
            None,
            "short summary",
            None,
            CompactionReason::Threshold,
        );
        assert!(outcome.tokens_after <= prepared.tokens_before);
    }

    #[test]
    fn split_turn_produces_delimiter_and_prefix_slice() {
        // index 0 system, 1 user (turn start), 2 assistant (mid-turn, no
        // tool calls so it is itself a valid cut point but not a turn
        // boundary), 3 user, 4 assistant — keep_recent_tokens tuned to land
        // the cut on index 2.
        let entries = chain(vec![
            msg(Role::System, "sys"),
            msg(Role::User, &"u".repeat(40)),
            msg(Role::Assistant, &"a".repeat(40)),
            msg(Role::User, &"u2".repeat(40)),
            msg(Role::Assistant, &"a2".repeat(40)),
        ]);
        // tokens: entry4 ~ (80/4+10)=30, entry3 ~ 30, cumulative after 3,4 = 60
        // entry2 ~ 20, cumulative = 80 -> cut lands at index 2 once >= keep_tail
        let cut = find_cut_point(&entries, 75, true);
        assert_eq!(cut.cut_index, 2);
        assert!(cut.is_split);
        assert_eq!(cut.turn_start_index, Some(1));

        let prepared = prepare_compaction(&entries, 75, true).unwrap();
        assert!(prepared.is_split_turn);
        assert_eq!(prepared.turn_prefix_messages.len(), 1);
        let outcome = compact(
            &prepared,
            None,
            "history summary",
            Some("prefix summary"),
            CompactionReason::Threshold,
        );
        if let EntryBody::Compaction { summary, .. } = outcome.body {
            assert!(summary.contains(SPLIT_TURN_DELIMITER));
        } else {
            panic!("expected compaction body");
        }
    }

    #[test]
    fn prepare_compaction_ignores_entries_before_last_compaction() {
        let mut entries = chain(vec![
            msg(Role::User, "old"),
            msg(Role::Assistant, "old reply"),
        ]);
        let compaction_entry = Entry::new(
            entries.last().map(|e| e.id.clone()),
            EntryBody::Compaction {
                reason: CompactionReason::Manual,
                summary: "s".into(),
                previous_summary: None,
                first_kept_entry_id: entries[1].id.clone(),
                tokens_before: 100,
                tokens_after: 10,
            },
        );
        entries.push(compaction_entry);
        let mut tail = chain(vec![
            msg(Role::User, &"x".repeat(400)),
            msg(Role::Assistant, &"y".repeat(400)),
        ]);
        // re-link tail's first parent to the compaction entry
        if let Some(first) = tail.first_mut() {
            first.parent_id = entries.last().map(|e| e.id.clone());
        }
        entries.append(&mut tail);

        let prepared = prepare_compaction(&entries, 10, true).unwrap();
        // dropped must include the compaction entry itself and everything
        // before the window's cut, never the pre-compaction "old" messages
        // re-summarized independently of that boundary.
        assert!(prepared
            .dropped
            .iter()
            .any(|e| matches!(e.body, EntryBody::Compaction { .. })));
    }

    #[test]
    fn estimate_tokens_is_four_chars_per_token() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
