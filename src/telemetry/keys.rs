// Per-key-per-site pipeline
//
// One entry per (tracker, key) pair, tracking which tokens each first
// party saw under that key. Entries with only safe tokens aggregate per
// site; an unsafe token isolates its entry into an own message so the
// backend can attribute it precisely.

use crate::telemetry::cached_entry::{EntryKind, MessagePayload};
use crate::telemetry::db::KEYS_TABLE;
use crate::telemetry::BatchItem;
use rand::seq::IteratorRandom;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub struct KeyKind {
    /// Token sets above this size are uniformly sampled. Rare random
    /// high-frequency IDs cannot reach quorum anyway, so the sample
    /// loses nothing that could ever be reported.
    pub tokens_limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct KeyEntry {
    pub key: String,
    pub tracker: String,
    /// site hash -> token hash -> safe.
    pub sites_tokens: BTreeMap<String, BTreeMap<String, bool>>,
}

impl KeyEntry {
    /// Cardinality of the union of all site token sets.
    pub fn token_count(&self) -> usize {
        self.sites_tokens
            .values()
            .flat_map(|tokens| tokens.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }
}

impl EntryKind for KeyKind {
    type Entry = KeyEntry;

    fn table(&self) -> &'static str {
        KEYS_TABLE
    }

    fn cache_key(&self, item: &BatchItem) -> String {
        format!("{}:{}", item.tracker, item.key_hash)
    }

    fn empty_entry(&self) -> KeyEntry {
        KeyEntry::default()
    }

    fn update_entry(&self, entry: &mut KeyEntry, item: &BatchItem) {
        entry.key = item.key_hash.clone();
        entry.tracker = item.tracker.clone();
        let tokens = entry.sites_tokens.entry(item.site.clone()).or_default();
        let safe = tokens.get(&item.token_hash).copied().unwrap_or(true);
        tokens.insert(item.token_hash.clone(), safe && item.safe);
    }

    fn merge_row(&self, entry: &mut KeyEntry, data: &Value) {
        if entry.key.is_empty() {
            if let Some(key) = data["key"].as_str() {
                entry.key = key.to_string();
            }
        }
        if entry.tracker.is_empty() {
            if let Some(tracker) = data["tracker"].as_str() {
                entry.tracker = tracker.to_string();
            }
        }
        let Some(sites) = data["sitesTokens"].as_object() else {
            return;
        };
        for (site, tokens) in sites {
            let entry_tokens = entry.sites_tokens.entry(site.clone()).or_default();
            let Some(tokens) = tokens.as_object() else {
                continue;
            };
            for (token, safe) in tokens {
                let known = entry_tokens.get(token).copied().unwrap_or(true);
                entry_tokens.insert(token.clone(), known && safe.as_bool().unwrap_or(true));
            }
        }
    }

    fn serialise(&self, entry: &KeyEntry) -> Value {
        json!({
            "key": entry.key,
            "tracker": entry.tracker,
            "sitesTokens": entry.sites_tokens,
        })
    }

    fn multi_site(&self, entry: &KeyEntry) -> bool {
        entry.sites_tokens.len() > 1
    }

    fn payloads(&self, day: &str, batch: &[(String, KeyEntry)]) -> Vec<MessagePayload> {
        let mut messages = Vec::new();
        // site hash -> safe key groups for that site.
        let mut safe_groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();

        for (_, entry) in batch {
            for (site, tokens) in &entry.sites_tokens {
                let sampled = self.sample_tokens(tokens);
                let has_unsafe = sampled.values().any(|safe| !safe.as_bool().unwrap_or(true));
                if has_unsafe {
                    messages.push(MessagePayload {
                        payload: json!({
                            "ts": day,
                            "site": site,
                            "tracker": entry.tracker,
                            "key": entry.key,
                            "tokens": Value::Object(sampled),
                        }),
                        deduplicate_by: format!(
                            "{day}|{site}|{}|{}",
                            entry.tracker, entry.key
                        ),
                    });
                } else {
                    safe_groups.entry(site.clone()).or_default().push(json!({
                        "tracker": entry.tracker,
                        "key": entry.key,
                        "tokens": Value::Object(sampled),
                    }));
                }
            }
        }

        for (site, keys) in safe_groups {
            messages.push(MessagePayload {
                payload: json!({
                    "ts": day,
                    "site": site,
                    "keys": keys,
                }),
                deduplicate_by: format!("{day}|{site}"),
            });
        }
        messages
    }

    fn has_data(&self, data: &Value) -> bool {
        data["sitesTokens"].as_object().is_some_and(|s| !s.is_empty())
    }
}

impl KeyKind {
    fn sample_tokens(&self, tokens: &BTreeMap<String, bool>) -> Map<String, Value> {
        if tokens.len() <= self.tokens_limit {
            return tokens
                .iter()
                .map(|(token, safe)| (token.clone(), Value::Bool(*safe)))
                .collect();
        }
        let mut rng = rand::rng();
        tokens
            .iter()
            .choose_multiple(&mut rng, self.tokens_limit)
            .into_iter()
            .map(|(token, safe)| (token.clone(), Value::Bool(*safe)))
            .collect()
    }
}
