//! In-memory inverted index over message metadata and optional body text.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use mailledger_remote::MessageId;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::store::MessageRecord;

/// Split text into lowercase alphanumeric terms.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// Search filters. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free text; all terms must match, the last one as a prefix.
    pub text: String,
    /// Folder path.
    pub folder: Option<String>,
    /// Substring of the sender address.
    pub sender: Option<String>,
    /// Earliest message date.
    pub since: Option<DateTime<Utc>>,
    /// Latest message date.
    pub until: Option<DateTime<Utc>>,
    /// Unread messages only.
    pub unread_only: bool,
    /// Flagged messages only.
    pub flagged_only: bool,
    /// Messages with attachments only.
    pub has_attachments: bool,
    /// Maximum hits; zero means unlimited.
    pub limit: usize,
}

impl SearchQuery {
    /// Free-text query.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Restrict to a folder.
    #[must_use]
    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Restrict to a sender.
    #[must_use]
    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into().to_lowercase());
        self
    }

    /// Restrict to a date range.
    #[must_use]
    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Unread messages only.
    #[must_use]
    pub fn unread(mut self) -> Self {
        self.unread_only = true;
        self
    }

    /// Cap the number of hits.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Message id.
    pub id: MessageId,
    /// Folder path.
    pub folder: String,
    /// Message date.
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IndexedDoc {
    folder: String,
    date: DateTime<Utc>,
    from_email: String,
    seen: bool,
    flagged: bool,
    has_attachments: bool,
    terms: BTreeSet<String>,
    #[serde(default)]
    body_terms: BTreeSet<String>,
}

impl IndexedDoc {
    fn all_terms(&self) -> impl Iterator<Item = &String> {
        self.terms.union(&self.body_terms)
    }
}

/// Inverted index for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvertedIndex {
    postings: BTreeMap<String, BTreeSet<MessageId>>,
    docs: HashMap<MessageId, IndexedDoc>,
}

impl InvertedIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a serialized snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid snapshot.
    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Serialize to a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Number of indexed messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Returns true if the message is indexed.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.docs.contains_key(id)
    }

    /// Index or re-index a message. Body terms from an earlier
    /// [`set_body`](Self::set_body) are kept.
    pub fn upsert(&mut self, record: &MessageRecord) {
        let body_terms = self
            .remove_doc(&record.id)
            .map(|doc| doc.body_terms)
            .unwrap_or_default();

        let mut terms = BTreeSet::new();
        for field in [
            record.subject.as_str(),
            record.from_name.as_str(),
            record.from_email.as_str(),
            record.snippet.as_str(),
        ] {
            terms.extend(tokenize(field));
        }
        for value in record.to.iter().chain(&record.labels) {
            terms.extend(tokenize(value));
        }

        let doc = IndexedDoc {
            folder: record.folder.clone(),
            date: record.date,
            from_email: record.from_email.to_lowercase(),
            seen: record.flags.seen,
            flagged: record.flags.flagged,
            has_attachments: record.has_attachments,
            terms,
            body_terms,
        };
        self.insert_doc(record.id.clone(), doc);
    }

    /// Add body text terms to an indexed message. Returns false if the
    /// message is not indexed.
    pub fn set_body(&mut self, id: &MessageId, text: &str) -> bool {
        let Some(mut doc) = self.remove_doc(id) else {
            return false;
        };
        doc.body_terms = tokenize(text).collect();
        self.insert_doc(id.clone(), doc);
        true
    }

    /// Drop a message. Returns true if it was indexed.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        self.remove_doc(id).is_some()
    }

    /// Run a query, newest first.
    #[must_use]
    pub fn search(&self, query: &SearchQuery) -> Vec<SearchHit> {
        let terms: Vec<String> = tokenize(&query.text).collect();
        let candidates: Vec<&MessageId> = match terms.split_last() {
            None => self.docs.keys().collect(),
            Some((last, rest)) => {
                let mut sets: Vec<BTreeSet<&MessageId>> = rest
                    .iter()
                    .map(|term| self.postings.get(term).into_iter().flatten().collect())
                    .collect();
                sets.push(
                    self.postings
                        .range(last.clone()..)
                        .take_while(|(term, _)| term.starts_with(last.as_str()))
                        .flat_map(|(_, ids)| ids)
                        .collect(),
                );
                let mut sets = sets.into_iter();
                let first = sets.next().unwrap_or_default();
                sets.fold(first, |acc, set| acc.intersection(&set).copied().collect())
                    .into_iter()
                    .collect()
            }
        };

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|id| self.docs.get(id).map(|doc| (id, doc)))
            .filter(|(_, doc)| Self::matches_filters(doc, query))
            .map(|(id, doc)| SearchHit {
                id: id.clone(),
                folder: doc.folder.clone(),
                date: doc.date,
            })
            .collect();

        hits.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));
        if query.limit > 0 {
            hits.truncate(query.limit);
        }
        hits
    }

    fn matches_filters(doc: &IndexedDoc, query: &SearchQuery) -> bool {
        query.folder.as_ref().is_none_or(|folder| &doc.folder == folder)
            && query
                .sender
                .as_ref()
                .is_none_or(|sender| doc.from_email.contains(sender.as_str()))
            && query.since.is_none_or(|since| doc.date >= since)
            && query.until.is_none_or(|until| doc.date <= until)
            && (!query.unread_only || !doc.seen)
            && (!query.flagged_only || doc.flagged)
            && (!query.has_attachments || doc.has_attachments)
    }

    fn insert_doc(&mut self, id: MessageId, doc: IndexedDoc) {
        for term in doc.all_terms() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.clone());
        }
        self.docs.insert(id, doc);
    }

    fn remove_doc(&mut self, id: &MessageId) -> Option<IndexedDoc> {
        let doc = self.docs.remove(id)?;
        for term in doc.all_terms() {
            if let Some(ids) = self.postings.get_mut(term) {
                ids.remove(id);
                if ids.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        Some(doc)
    }
}
