//! Intent classification over the last user message. Word-bounded
//! regexes; the bits steer persona, planning, memory fetch, and tool
//! exposure.

use std::sync::LazyLock;

use regex::Regex;

static CODING_KEYWORDS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"\bpython\b", r"\bbash\b", r"\bsh\b", r"\bscript\b", r"\bcode\b", r"\bdef\b", r"\bimport\b"]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
});
static CODING_ACTIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bwrite\b", r"\brun\b", r"\bexecute\b", r"\bdebug\b", r"\bfix\b", r"\bcreate\b",
        r"\bgenerate\b", r"\bcount\b", r"\bcalculate\b", r"\banalyze\b", r"\bscrape\b",
        r"\bplot\b", r"\bgraph\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
static DBA_KEYWORDS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bsql\b", r"\bpostgres\b", r"\bpostgresql\b", r"\bpsql\b", r"\bdatabase\b",
        r"\bpg_stat\b", r"\bexplain analyze\b", r"\bquery\b", r"\bcte\b", r"\brdbms\b",
        r"\bdba\b", r"\bschema\b", r"\bvacuum\b", r"\bmvcc\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
static META_KEYWORDS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"\btitle\b", r"\bname this\b", r"\brename\b", r"\bsummary\b", r"\bsummarize\b", r"\bcaption\b", r"\bdescribe\b"]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
});
/// A message that is nothing but arithmetic is not a coding task.
static PLAIN_ARITHMETIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d\s\+\-\*/\(\)=\?]+$").unwrap());

const ACTION_VERBS: &[&str] = &[
    "search", "download", "run", "execute", "schedule", "read", "fetch", "calculate", "count",
    "summarize", "find", "open", "check", "test", "delete", "remove", "rename", "move", "copy",
    "scrape", "ingest",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct Intent {
    pub has_coding_intent: bool,
    pub has_dba_intent: bool,
    pub is_meta_task: bool,
    pub has_action_verb: bool,
    pub is_conversational: bool,
    pub is_fact_check: bool,
}

impl Intent {
    pub fn classify(last_user: &str) -> Intent {
        let lc = last_user.to_lowercase();

        let mut has_coding_intent = CODING_KEYWORDS.iter().any(|re| re.is_match(&lc))
            && CODING_ACTIONS.iter().any(|re| re.is_match(&lc));
        if lc.contains(".py") || Regex::new(r"\bscript\b").unwrap().is_match(&lc) {
            has_coding_intent = true;
        }
        if PLAIN_ARITHMETIC.is_match(&lc) {
            has_coding_intent = false;
        }

        let has_dba_intent = DBA_KEYWORDS.iter().any(|re| re.is_match(&lc));
        let is_meta_task = META_KEYWORDS.iter().any(|re| re.is_match(&lc));
        let has_action_verb = ACTION_VERBS.iter().any(|v| lc.contains(v));
        let is_fact_check = lc.contains("fact-check") || lc.contains("verify");

        Intent {
            has_coding_intent,
            has_dba_intent,
            is_meta_task,
            has_action_verb,
            is_conversational: !has_coding_intent
                && !has_dba_intent
                && !is_meta_task
                && !has_action_verb,
            is_fact_check,
        }
    }

    /// Whether memory context should be fetched for this request.
    pub fn should_fetch_memory(&self, last_user: &str) -> bool {
        !self.is_fact_check
            && (!self.has_coding_intent
                || last_user.contains("remember")
                || last_user.contains("previous"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coding_needs_keyword_and_action() {
        assert!(Intent::classify("write a python script to sort files").has_coding_intent);
        assert!(!Intent::classify("I like python snakes").has_coding_intent);
        assert!(Intent::classify("debug main.py").has_coding_intent);
    }

    #[test]
    fn plain_arithmetic_is_not_coding() {
        let intent = Intent::classify("2 + 2 = ?");
        assert!(!intent.has_coding_intent);
    }

    #[test]
    fn dba_detection() {
        assert!(Intent::classify("run EXPLAIN ANALYZE on this query").has_dba_intent);
        assert!(Intent::classify("why is vacuum slow on that table").has_dba_intent);
        assert!(!Intent::classify("tell me a story").has_dba_intent);
    }

    #[test]
    fn conversational_when_nothing_matches() {
        let intent = Intent::classify("Hi");
        assert!(intent.is_conversational);
        assert!(!intent.has_action_verb);
    }

    #[test]
    fn action_verbs_break_conversational() {
        let intent = Intent::classify("please download the report");
        assert!(intent.has_action_verb);
        assert!(!intent.is_conversational);
    }

    #[test]
    fn memory_fetch_policy() {
        let coding = Intent::classify("write a python script to sort files");
        assert!(!coding.should_fetch_memory("write a python script to sort files"));
        assert!(coding.should_fetch_memory("write a python script like the previous one"));

        let chat = Intent::classify("Hi");
        assert!(chat.should_fetch_memory("Hi"));

        let check = Intent::classify("verify this claim");
        assert!(!check.should_fetch_memory("verify this claim"));
    }
}
