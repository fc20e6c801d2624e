// Per-token aggregate pipeline
//
// One entry per observed token value (keyed by its md5), aggregating the
// first parties and trackers it appeared on. Only the cardinalities
// leave the client.

use crate::telemetry::cached_entry::{EntryKind, MessagePayload};
use crate::telemetry::db::TOKENS_TABLE;
use crate::telemetry::BatchItem;
use serde_json::{json, Value};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct TokenEntry {
    pub sites: BTreeSet<String>,
    pub trackers: BTreeSet<String>,
    pub safe: bool,
}

pub struct TokenKind;

impl EntryKind for TokenKind {
    type Entry = TokenEntry;

    fn table(&self) -> &'static str {
        TOKENS_TABLE
    }

    fn cache_key(&self, item: &BatchItem) -> String {
        item.token_hash.clone()
    }

    fn empty_entry(&self) -> TokenEntry {
        TokenEntry {
            sites: BTreeSet::new(),
            trackers: BTreeSet::new(),
            safe: true,
        }
    }

    fn update_entry(&self, entry: &mut TokenEntry, item: &BatchItem) {
        entry.sites.insert(item.site.clone());
        entry.trackers.insert(item.tracker.clone());
        entry.safe = entry.safe && item.safe;
    }

    fn merge_row(&self, entry: &mut TokenEntry, data: &Value) {
        for site in strings_of(&data["sites"]) {
            entry.sites.insert(site);
        }
        for tracker in strings_of(&data["trackers"]) {
            entry.trackers.insert(tracker);
        }
        if data["safe"] == Value::Bool(false) {
            entry.safe = false;
        }
    }

    fn serialise(&self, entry: &TokenEntry) -> Value {
        json!({
            "sites": entry.sites,
            "trackers": entry.trackers,
            "safe": entry.safe,
        })
    }

    fn multi_site(&self, entry: &TokenEntry) -> bool {
        entry.sites.len() > 1
    }

    fn payloads(&self, day: &str, batch: &[(String, TokenEntry)]) -> Vec<MessagePayload> {
        if batch.is_empty() {
            return Vec::new();
        }
        let groups: Vec<Value> = batch
            .iter()
            .map(|(token, entry)| {
                json!({
                    "ts": day,
                    "token": token,
                    "safe": entry.safe,
                    "sites": entry.sites.len(),
                    "trackers": entry.trackers.len(),
                })
            })
            .collect();
        let mut tokens: Vec<&str> = batch.iter().map(|(token, _)| token.as_str()).collect();
        tokens.sort_unstable();
        vec![MessagePayload {
            payload: Value::Array(groups),
            deduplicate_by: format!("{day}|{}", tokens.join(",")),
        }]
    }

    fn has_data(&self, data: &Value) -> bool {
        data["sites"].as_array().is_some_and(|a| !a.is_empty())
            && data["trackers"].as_array().is_some_and(|a| !a.is_empty())
    }
}

fn strings_of(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
