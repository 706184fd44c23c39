//! Record filtering policy.
//!
//! Decides whether a record is hidden from a board's thread view. The policy
//! is a pure function of the record and the owning board's [`FilterConfig`]
//! (plus two engine-wide settings carried in [`FilterPolicy`]), so the
//! builder can call it as often as the cascading prune needs.
//!
//! Rules are evaluated in order and the first match blocks:
//! 1. junk records, unless junk display is enabled
//! 2. trust classifications the board hides (friends are never hidden)
//! 3. senders with too few accepted messages
//! 4. keyword block lists for subject, body and attached board names
//!
//! Rules 3 and 4 never apply to `good` or `friend` records.

use crate::constants::KEYWORD_SEPARATOR;
use crate::record::{Record, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A single `;`-delimited keyword block list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    /// Whether this list is consulted at all.
    #[serde(default)]
    pub enabled: bool,
    /// Raw list, entries separated by `;`.
    #[serde(default)]
    pub keywords: String,
}

impl KeywordRule {
    /// Creates an enabled rule from a raw keyword list.
    pub fn new(keywords: impl Into<String>) -> Self {
        Self {
            enabled: true,
            keywords: keywords.into(),
        }
    }

    /// Iterates the lowercased, non-empty entries of the list.
    pub fn entries(&self) -> impl Iterator<Item = String> + '_ {
        self.keywords
            .split(KEYWORD_SEPARATOR)
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|k| k.to_lowercase())
    }

    /// Returns true if the rule is enabled and any entry occurs in one of the texts.
    ///
    /// Matching is a case-insensitive substring search.
    pub fn matches<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> bool {
        if !self.enabled {
            return false;
        }
        let haystacks: Vec<String> = texts.into_iter().map(str::to_lowercase).collect();
        self.entries()
            .any(|keyword| haystacks.iter().any(|h| h.contains(&keyword)))
    }
}

/// Per-board filter configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Hide unsigned (`none`) and `tampered` records.
    #[serde(default)]
    pub hide_unsigned: bool,
    /// Hide records from `bad` senders.
    #[serde(default)]
    pub hide_bad: bool,
    /// Hide records from `neutral` senders.
    #[serde(default)]
    pub hide_neutral: bool,
    /// Hide records from `good` senders.
    #[serde(default)]
    pub hide_good: bool,
    /// Minimum accepted-message count a sender needs; 0 disables the rule.
    #[serde(default)]
    pub min_sender_messages: u64,
    /// Private records are exempt from the sender-count rule.
    #[serde(default)]
    pub exempt_private: bool,
    /// Block list matched against subject and headers.
    #[serde(default)]
    pub subject: KeywordRule,
    /// Block list matched against the body.
    #[serde(default)]
    pub body: KeywordRule,
    /// Block list matched against attached board names.
    #[serde(default)]
    pub boards: KeywordRule,
}

impl FilterConfig {
    /// Returns true if the trust rule hides this classification.
    pub fn hides_trust(&self, trust: TrustLevel) -> bool {
        match trust {
            TrustLevel::None | TrustLevel::Tampered => self.hide_unsigned,
            TrustLevel::Bad => self.hide_bad,
            TrustLevel::Neutral => self.hide_neutral,
            TrustLevel::Good => self.hide_good,
            TrustLevel::Friend => false,
        }
    }
}

/// Why a record was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Junk record while junk display is off.
    Junk,
    /// Trust classification hidden by the board.
    Trust(TrustLevel),
    /// Sender has too few accepted messages.
    LowSenderCount,
    /// Subject or headers matched a keyword.
    SubjectKeyword,
    /// Body matched a keyword.
    BodyKeyword,
    /// An attached board name matched a keyword.
    BoardKeyword,
}

/// Filter configuration of one board together with the engine-wide settings.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    /// The owning board's configuration.
    pub config: FilterConfig,
    /// Global junk display switch.
    pub show_junk: bool,
    /// Identities whose records count as self-authored.
    pub self_identities: HashSet<String>,
}

impl FilterPolicy {
    /// Creates a policy for a board configuration with default global settings.
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            show_junk: false,
            self_identities: HashSet::new(),
        }
    }

    /// Returns true if the record is hidden by this policy.
    pub fn is_blocked(&self, record: &Record) -> bool {
        self.block_reason(record).is_some()
    }

    /// Returns the first rule that blocks the record, if any.
    pub fn block_reason(&self, record: &Record) -> Option<BlockReason> {
        if record.is_junk && !self.show_junk {
            return Some(BlockReason::Junk);
        }

        if self.config.hides_trust(record.trust) {
            return Some(BlockReason::Trust(record.trust));
        }

        if record.trust.is_trusted() {
            return None;
        }

        if self.is_low_sender_count(record) {
            return Some(BlockReason::LowSenderCount);
        }

        let config = &self.config;
        if config
            .subject
            .matches([record.subject.as_str(), record.headers.as_str()])
        {
            return Some(BlockReason::SubjectKeyword);
        }
        if config.body.matches([record.body.as_str()]) {
            return Some(BlockReason::BodyKeyword);
        }
        if config
            .boards
            .matches(record.attached_boards.iter().map(String::as_str))
        {
            return Some(BlockReason::BoardKeyword);
        }

        None
    }

    fn is_self_authored(&self, record: &Record) -> bool {
        record
            .sender
            .as_ref()
            .map(|s| self.self_identities.contains(&s.identity))
            .unwrap_or(false)
    }

    fn is_low_sender_count(&self, record: &Record) -> bool {
        let threshold = self.config.min_sender_messages;
        if threshold == 0 || self.is_self_authored(record) {
            return false;
        }
        if self.config.exempt_private && record.is_private() {
            return false;
        }
        let accepted = record.sender.as_ref().map_or(0, |s| s.accepted_messages);
        accepted < threshold
    }
}

/// Returns true if `record` is hidden by `policy`.
pub fn is_blocked(record: &Record, policy: &FilterPolicy) -> bool {
    policy.is_blocked(record)
}
