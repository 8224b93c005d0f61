// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Mapping of raw driver error text to [`ErrorCode`]s and [`RecoveryAction`]s.
//!
//! The driver only reports failures as human-readable text.
//! The [`ErrorClassifier`] matches that text against an ordered rule table.
//! The first matching rule wins, so the order of [`DEFAULT_RULES`] is significant:
//! connection loss is checked before everything else.

use std::borrow::Cow;

use crate::error_::ErrorCode;

/// What the pool should do with the session that produced an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    /// The session is healthy: return it to the pool.
    PutBack,
    /// The session's connection is lost: repair it in the background.
    Reconnect,
    /// The session's socket is stale: refresh it, then return it to the pool.
    RefreshAndPutBack,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Classification {
    pub code: ErrorCode,
    pub action: RecoveryAction,
}

impl Classification {
    pub const fn new(code: ErrorCode, action: RecoveryAction) -> Self {
        Self { code, action }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Matcher {
    Exact(&'static str),
    Prefix(&'static str),
    Suffix(&'static str),
    Contains(&'static str),
}

impl Matcher {
    pub fn matches(&self, text: &str) -> bool {
        match self {
            Matcher::Exact(pattern) => text == *pattern,
            Matcher::Prefix(pattern) => text.starts_with(pattern),
            Matcher::Suffix(pattern) => text.ends_with(pattern),
            Matcher::Contains(pattern) => text.contains(pattern),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rule {
    pub matcher: Matcher,
    pub classification: Classification,
}

impl Rule {
    pub const fn new(matcher: Matcher, code: ErrorCode, action: RecoveryAction) -> Self {
        Self {
            matcher,
            classification: Classification::new(code, action),
        }
    }
}

const fn reconnect(matcher: Matcher) -> Rule {
    Rule::new(matcher, ErrorCode::ConnectFailure, RecoveryAction::Reconnect)
}

const fn refresh(matcher: Matcher, code: ErrorCode) -> Rule {
    Rule::new(matcher, code, RecoveryAction::RefreshAndPutBack)
}

const fn put_back(matcher: Matcher, code: ErrorCode) -> Rule {
    Rule::new(matcher, code, RecoveryAction::PutBack)
}

pub const UNMATCHED: Classification =
    Classification::new(ErrorCode::Unknown, RecoveryAction::PutBack);

pub const DEFAULT_RULES: &[Rule] = &[
    // connection loss
    reconnect(Matcher::Exact("EOF")),
    reconnect(Matcher::Contains("no reachable servers")),
    reconnect(Matcher::Contains("not master")),
    reconnect(Matcher::Contains("Closed explicitly")),
    reconnect(Matcher::Contains("closed explicitly")),
    reconnect(Matcher::Contains("broken pipe")),
    reconnect(Matcher::Contains("connection reset by peer")),
    reconnect(Matcher::Contains("connection refused")),
    // transient I/O
    refresh(Matcher::Suffix("timeout"), ErrorCode::Timeout),
    refresh(Matcher::Prefix("read tcp"), ErrorCode::Timeout),
    refresh(Matcher::Prefix("write tcp"), ErrorCode::Timeout),
    // missing documents and namespaces
    put_back(Matcher::Exact("not found"), ErrorCode::NotFound),
    put_back(Matcher::Contains("ns not found"), ErrorCode::CollectionNotFound),
    put_back(Matcher::Contains("no collection"), ErrorCode::CollectionNotFound),
    // conflicts
    put_back(Matcher::Contains("E11000"), ErrorCode::DocumentConflict),
    put_back(
        Matcher::Prefix("multiple errors in bulk operation"),
        ErrorCode::DocumentConflict,
    ),
    put_back(Matcher::Suffix("already exists"), ErrorCode::CollectionConflict),
    // malformed arrays (update rules before the broader query rules)
    put_back(Matcher::Contains("$each"), ErrorCode::UpdateInputArray),
    put_back(
        Matcher::Contains("$pullAll requires an array"),
        ErrorCode::UpdateInputArray,
    ),
    put_back(
        Matcher::Contains("$pushAll requires an array"),
        ErrorCode::UpdateInputArray,
    ),
    put_back(Matcher::Contains("to non-array"), ErrorCode::UpdateInputArray),
    put_back(Matcher::Contains("needs an array"), ErrorCode::QueryInputArray),
    put_back(Matcher::Contains("must be an array"), ErrorCode::QueryInputArray),
    // update operators
    put_back(
        Matcher::Contains("'$set' is empty"),
        ErrorCode::BadUpdateOperatorUsage,
    ),
    put_back(
        Matcher::Contains("'$unset' is empty"),
        ErrorCode::BadUpdateOperatorUsage,
    ),
    put_back(
        Matcher::Contains("'$inc' is empty"),
        ErrorCode::BadUpdateOperatorUsage,
    ),
    put_back(
        Matcher::Contains("'$rename' is empty"),
        ErrorCode::BadUpdateOperatorUsage,
    ),
    put_back(
        Matcher::Prefix("Unknown modifier"),
        ErrorCode::BadUpdateOperatorUsage,
    ),
    // field and index edge cases
    put_back(
        Matcher::Exact("$regex has to be a string"),
        ErrorCode::RegexString,
    ),
    put_back(Matcher::Prefix("The dotted field"), ErrorCode::DotField),
    put_back(
        Matcher::Contains("key too large to index"),
        ErrorCode::StringIndexTooLong,
    ),
    // must stay behind "Unknown modifier"
    put_back(Matcher::Prefix("Unknown"), ErrorCode::NotFound),
];

/// Ordered, table driven error classifier.
///
/// # Example
/// ```
/// use mgopool::classify::{ErrorClassifier, RecoveryAction};
/// use mgopool::ErrorCode;
///
/// let classifier = ErrorClassifier::default();
/// let verdict = classifier.classify("E11000 duplicate key error collection: db.users");
/// assert_eq!(verdict.code, ErrorCode::DocumentConflict);
/// assert_eq!(verdict.action, RecoveryAction::PutBack);
/// ```
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Cow<'static, [Rule]>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: Cow::Borrowed(DEFAULT_RULES),
        }
    }
}

impl ErrorClassifier {
    /// Create a classifier with a custom rule table.
    ///
    /// Rules are evaluated in order, text that matches no rule is classified as
    /// [`ErrorCode::Unknown`] with [`RecoveryAction::PutBack`].
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: Cow::Owned(rules),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn classify(&self, raw: &str) -> Classification {
        let text = raw.trim();
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(text))
            .map(|rule| rule.classification)
            .unwrap_or(UNMATCHED)
    }
}

/// Classify with the default rule table.
pub fn classify(raw: &str) -> Classification {
    ErrorClassifier::default().classify(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    use ErrorCode::*;
    use RecoveryAction::*;

    #[rstest]
    #[case("no reachable servers", ConnectFailure, Reconnect)]
    #[case("EOF", ConnectFailure, Reconnect)]
    #[case("not master and slaveOk=false", ConnectFailure, Reconnect)]
    #[case("Closed explicitly", ConnectFailure, Reconnect)]
    #[case("write tcp 10.0.0.1:4711->10.0.0.2:27017: write: broken pipe", ConnectFailure, Reconnect)]
    #[case("read tcp 10.0.0.1:4711->10.0.0.2:27017: read: connection reset by peer", ConnectFailure, Reconnect)]
    #[case("i/o timeout ", Timeout, RefreshAndPutBack)]
    #[case("read tcp 10.0.0.1:4711->10.0.0.2:27017: i/o timeout", Timeout, RefreshAndPutBack)]
    #[case("write tcp 10.0.0.1:4711->10.0.0.2:27017: use of closed socket", Timeout, RefreshAndPutBack)]
    #[case("not found", NotFound, PutBack)]
    #[case("Unknown database", NotFound, PutBack)]
    #[case("ns not found", CollectionNotFound, PutBack)]
    #[case("no collection", CollectionNotFound, PutBack)]
    #[case("E11000 duplicate key", DocumentConflict, PutBack)]
    #[case("multiple errors in bulk operation:\n  - E11000 duplicate key", DocumentConflict, PutBack)]
    #[case("collection already exists", CollectionConflict, PutBack)]
    #[case("$in needs an array", QueryInputArray, PutBack)]
    #[case("$and/$or/$nor entries must be an array", QueryInputArray, PutBack)]
    #[case("The argument to $each in $push must be an array but it was of type: string", UpdateInputArray, PutBack)]
    #[case("$each term takes only $slice (and optionally $sort) as complements", UpdateInputArray, PutBack)]
    #[case("$pullAll requires an array argument", UpdateInputArray, PutBack)]
    #[case("Cannot apply $push modifier to non-array", UpdateInputArray, PutBack)]
    #[case("'$set' is empty. You must specify a field like so: {$set: {<field>: ...}}", BadUpdateOperatorUsage, PutBack)]
    #[case("'$unset' is empty. You must specify a field like so: {$unset: {<field>: ...}}", BadUpdateOperatorUsage, PutBack)]
    #[case("'$inc' is empty. You must specify a field like so: {$inc: {<field>: ...}}", BadUpdateOperatorUsage, PutBack)]
    #[case("'$rename' is empty. You must specify a field like so: {$rename: {<field>: ...}}", BadUpdateOperatorUsage, PutBack)]
    #[case("Unknown modifier: $sett", BadUpdateOperatorUsage, PutBack)]
    #[case("$regex has to be a string", RegexString, PutBack)]
    #[case("The dotted field 'a.b' in 'x.a.b' is not valid for storage.", DotField, PutBack)]
    #[case("Btree::insert: key too large to index, failing", StringIndexTooLong, PutBack)]
    #[case("something nobody has seen before", Unknown, PutBack)]
    #[case("", Unknown, PutBack)]
    fn test_default_table(
        #[case] raw: &str,
        #[case] code: ErrorCode,
        #[case] action: RecoveryAction,
    ) {
        assert_eq!(classify(raw), Classification::new(code, action));
    }

    #[rstest]
    fn test_classification_is_deterministic() {
        let classifier = ErrorClassifier::default();
        for rule in classifier.rules() {
            let sample = match rule.matcher {
                Matcher::Exact(p) | Matcher::Prefix(p) | Matcher::Suffix(p) => p,
                Matcher::Contains(p) => p,
            };
            let first = classifier.classify(sample);
            for _ in 0..10 {
                assert_eq!(classifier.classify(sample), first);
            }
        }
    }

    #[rstest]
    fn test_first_match_wins() {
        let classifier = ErrorClassifier::new(vec![
            Rule::new(Matcher::Contains("dup"), DocumentConflict, PutBack),
            Rule::new(Matcher::Contains("dup"), ConnectFailure, Reconnect),
        ]);
        assert_eq!(classifier.classify("dup").code, DocumentConflict);
    }

    #[rstest]
    fn test_custom_table_falls_back_to_unknown() {
        let classifier = ErrorClassifier::new(vec![]);
        assert_eq!(classifier.classify("EOF"), UNMATCHED);
    }

    #[rstest]
    #[case(Matcher::Exact("EOF"), "EOF", true)]
    #[case(Matcher::Exact("EOF"), "EOF!", false)]
    #[case(Matcher::Prefix("read tcp"), "read tcp 1.2.3.4", true)]
    #[case(Matcher::Prefix("read tcp"), "a read tcp", false)]
    #[case(Matcher::Suffix("timeout"), "i/o timeout", true)]
    #[case(Matcher::Suffix("timeout"), "timeout reached", false)]
    #[case(Matcher::Contains("E11000"), "x E11000 y", true)]
    fn test_matchers(#[case] matcher: Matcher, #[case] text: &str, #[case] expected: bool) {
        assert_eq!(matcher.matches(text), expected);
    }
}
