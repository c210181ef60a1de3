//! In-memory tool registry: domain slices, collision resolution, diffing,
//! substring search, and fuzzy name resolution.
//!
//! The registry keeps two indices in lockstep: a `domain -> (name -> entry)`
//! two-level map and a flat `name -> entry` map. Writers replace an entire
//! domain slice under the write lock, so readers observe either the previous
//! snapshot or the new one, never a mix.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// How many fuzzy suggestions a not-found response may carry.
pub const MAX_SUGGESTIONS: usize = 5;
/// Minimum similarity for a name to appear among suggestions.
pub const SUGGESTION_THRESHOLD: f64 = 0.7;
/// Minimum similarity for `get_tool_schema` to silently resolve a near-miss.
pub const RESOLVE_THRESHOLD: f64 = 0.9;

/// One upstream tool as known to the gateway.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    /// Gateway-facing name, possibly `{domain}_{original_name}` after a collision.
    pub name: String,
    /// Name as registered by the upstream; used on the wire to that upstream.
    pub original_name: String,
    pub domain: String,
    pub group: Option<String>,
    pub description: String,
    pub input_schema: Value,
    pub annotations: Option<Value>,
}

/// Tool definition as reported by an upstream `tools/list`.
///
/// Parsed from raw JSON rather than a typed SDK model so vendor extensions
/// (`_meta`, extra annotation keys) survive the trip.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub annotations: Option<Value>,
    #[serde(default, rename = "_meta")]
    pub meta: Option<Value>,
}

impl ToolSpec {
    /// Sub-category within the domain: `_meta.group`, else `annotations.group`.
    #[must_use]
    pub fn group(&self) -> Option<String> {
        let from = |v: &Option<Value>| {
            v.as_ref()
                .and_then(|m| m.get("group"))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        from(&self.meta).or_else(|| from(&self.annotations))
    }
}

/// Per-domain summary for discovery responses.
#[derive(Debug, Clone, Serialize)]
pub struct DomainInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tool_count: usize,
    pub groups: Vec<String>,
}

/// Outcome of one `populate_domain` call.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryDiff {
    pub domain: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub tool_count: usize,
}

impl RegistryDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct DomainSlice {
    description: Option<String>,
    tools: HashMap<String, Arc<ToolEntry>>,
}

#[derive(Default)]
struct RegistryInner {
    domains: HashMap<String, DomainSlice>,
    flat: HashMap<String, Arc<ToolEntry>>,
}

/// Shared, concurrency-safe tool index.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole slice for `domain` atomically and report the diff.
    ///
    /// Collisions with other domains' original names re-key both sides to
    /// `{domain}_{original_name}`. A further collision on an already-prefixed
    /// name rejects the incoming entry and preserves what is registered.
    pub fn populate_domain(
        &self,
        domain: &str,
        tools: Vec<ToolSpec>,
        description: Option<String>,
    ) -> RegistryDiff {
        let mut inner = self.inner.write();

        let prev: HashSet<String> = inner
            .domains
            .get(domain)
            .map(|s| s.tools.keys().cloned().collect())
            .unwrap_or_default();

        // Pass 1: decide gateway-facing names and which foreign entries must
        // be re-keyed because their unprefixed name now collides.
        let mut planned: Vec<ToolEntry> = Vec::with_capacity(tools.len());
        let mut renames: Vec<(String, String)> = Vec::new(); // (old flat key, new name)
        let mut seen_original: HashSet<String> = HashSet::new();

        for spec in tools {
            if spec.name.is_empty() {
                tracing::warn!(domain = %domain, "upstream reported tool with empty name; skipping");
                continue;
            }
            if !seen_original.insert(spec.name.clone()) {
                tracing::warn!(domain = %domain, tool = %spec.name, "duplicate tool name from upstream; skipping");
                continue;
            }

            let schema = spec.input_schema.clone().unwrap_or_else(|| {
                serde_json::json!({"type": "object", "properties": {}})
            });
            if !schema.is_object() || jsonschema::validator_for(&schema).is_err() {
                tracing::warn!(
                    domain = %domain,
                    tool = %spec.name,
                    "tool input schema is not a valid JSON Schema object; skipping"
                );
                continue;
            }

            let foreign: Vec<&Arc<ToolEntry>> = inner
                .flat
                .values()
                .filter(|e| e.domain != domain && e.original_name == spec.name)
                .collect();

            let name = if foreign.is_empty() {
                spec.name.clone()
            } else {
                for other in &foreign {
                    if other.name == other.original_name {
                        renames.push((
                            other.name.clone(),
                            format!("{}_{}", other.domain, other.original_name),
                        ));
                    }
                }
                format!("{domain}_{}", spec.name)
            };

            planned.push(ToolEntry {
                name,
                original_name: spec.name.clone(),
                domain: domain.to_string(),
                group: spec.group(),
                description: spec.description.clone().unwrap_or_default(),
                input_schema: schema,
                annotations: spec.annotations.clone(),
            });
        }

        // Pass 2: re-key colliding foreign entries in both indices.
        for (old, new) in renames {
            if inner.flat.contains_key(&new) {
                tracing::warn!(from = %old, to = %new, "collision rename target already taken; keeping existing name");
                continue;
            }
            let Some(entry) = inner.flat.remove(&old) else {
                continue;
            };
            let mut renamed = (*entry).clone();
            renamed.name = new.clone();
            let renamed = Arc::new(renamed);
            if let Some(slice) = inner.domains.get_mut(&renamed.domain) {
                slice.tools.remove(&old);
                slice.tools.insert(new.clone(), Arc::clone(&renamed));
            }
            inner.flat.insert(new, renamed);
        }

        // Pass 3: drop this domain's previous entries, then insert the new
        // slice, rejecting any residual (secondary) collision.
        let old_keys: Vec<String> = inner
            .domains
            .remove(domain)
            .map(|s| s.tools.into_keys().collect())
            .unwrap_or_default();
        for key in old_keys {
            inner.flat.remove(&key);
        }

        let mut slice = DomainSlice {
            description,
            tools: HashMap::with_capacity(planned.len()),
        };
        for entry in planned {
            if inner.flat.contains_key(&entry.name) || slice.tools.contains_key(&entry.name) {
                tracing::warn!(
                    domain = %domain,
                    tool = %entry.name,
                    "secondary name collision; rejecting tool registration"
                );
                continue;
            }
            let entry = Arc::new(entry);
            slice.tools.insert(entry.name.clone(), Arc::clone(&entry));
            inner.flat.insert(entry.name.clone(), entry);
        }

        let now: HashSet<String> = slice.tools.keys().cloned().collect();
        let tool_count = now.len();
        inner.domains.insert(domain.to_string(), slice);

        let mut added: Vec<String> = now.difference(&prev).cloned().collect();
        let mut removed: Vec<String> = prev.difference(&now).cloned().collect();
        added.sort();
        removed.sort();

        RegistryDiff {
            domain: domain.to_string(),
            added,
            removed,
            tool_count,
        }
    }

    /// Exact lookup in the flat index.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ToolEntry>> {
        self.inner.read().flat.get(name).cloned()
    }

    /// Ranked fuzzy suggestions over every registered name.
    #[must_use]
    pub fn suggestions_for(&self, query: &str) -> Vec<String> {
        let inner = self.inner.read();
        rank_candidates(query, inner.flat.keys().map(String::as_str))
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Case-insensitive substring match on name and description, ordered by
    /// `(domain, name)`.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<Arc<ToolEntry>> {
        let needle = query.to_lowercase();
        let inner = self.inner.read();
        let mut hits: Vec<Arc<ToolEntry>> = inner
            .flat
            .values()
            .filter(|e| {
                e.name.to_lowercase().contains(&needle)
                    || e.description.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| (&a.domain, &a.name).cmp(&(&b.domain, &b.name)));
        hits
    }

    /// Snapshot of every entry, ordered by `(domain, name)`.
    #[must_use]
    pub fn all_entries(&self) -> Vec<Arc<ToolEntry>> {
        let inner = self.inner.read();
        let mut entries: Vec<Arc<ToolEntry>> = inner.flat.values().cloned().collect();
        entries.sort_by(|a, b| (&a.domain, &a.name).cmp(&(&b.domain, &b.name)));
        entries
    }

    /// Entries of one domain, ordered by name; `None` if the domain is unknown.
    #[must_use]
    pub fn domain_entries(&self, domain: &str) -> Option<Vec<Arc<ToolEntry>>> {
        let inner = self.inner.read();
        let slice = inner.domains.get(domain)?;
        let mut entries: Vec<Arc<ToolEntry>> = slice.tools.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Some(entries)
    }

    /// Domain summaries with derived counts and group sets, ordered by name.
    #[must_use]
    pub fn list_domains(&self) -> Vec<DomainInfo> {
        let inner = self.inner.read();
        let mut out: Vec<DomainInfo> = inner
            .domains
            .iter()
            .map(|(name, slice)| {
                let groups: BTreeSet<String> = slice
                    .tools
                    .values()
                    .filter_map(|e| e.group.clone())
                    .collect();
                DomainInfo {
                    name: name.clone(),
                    description: slice.description.clone(),
                    tool_count: slice.tools.len(),
                    groups: groups.into_iter().collect(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    #[must_use]
    pub fn get_domain_description(&self, domain: &str) -> Option<String> {
        self.inner
            .read()
            .domains
            .get(domain)
            .and_then(|s| s.description.clone())
    }

    #[must_use]
    pub fn has_domain(&self, domain: &str) -> bool {
        self.inner.read().domains.contains_key(domain)
    }

    /// Drop a domain and all of its entries. Returns whether it existed.
    pub fn remove_domain(&self, domain: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(slice) = inner.domains.remove(domain) else {
            return false;
        };
        for name in slice.tools.keys() {
            inner.flat.remove(name);
        }
        true
    }

    #[must_use]
    pub fn tool_count(&self, domain: &str) -> usize {
        self.inner
            .read()
            .domains
            .get(domain)
            .map_or(0, |s| s.tools.len())
    }

    /// Per-domain tool counts taken under one lock acquisition, so concurrent
    /// repopulation cannot produce a torn view across domains.
    #[must_use]
    pub fn tool_counts(&self) -> HashMap<String, usize> {
        self.inner
            .read()
            .domains
            .iter()
            .map(|(name, slice)| (name.clone(), slice.tools.len()))
            .collect()
    }

    #[must_use]
    pub fn total_tools(&self) -> usize {
        self.inner.read().flat.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().domains.is_empty()
    }
}

/// Similarity score in `[0, 1]` between a query and a candidate name.
///
/// Jaro-Winkler over lowercased input, floored at 0.85 when one side contains
/// the other (so `search` still suggests `apollo_search`). The substring bonus
/// is skipped for very short fragments to keep junk out of suggestions.
#[must_use]
pub fn similarity(query: &str, candidate: &str) -> f64 {
    let q = query.to_lowercase();
    let c = candidate.to_lowercase();
    let score = strsim::jaro_winkler(&q, &c);
    let shorter = q.len().min(c.len());
    if shorter >= 3 && (q.contains(&c) || c.contains(&q)) {
        score.max(0.85)
    } else {
        score
    }
}

/// Rank candidate names for a query: score descending, ties broken by shorter
/// name then lexicographic. At most [`MAX_SUGGESTIONS`] results at or above
/// [`SUGGESTION_THRESHOLD`].
#[must_use]
pub fn rank_candidates<'a>(
    query: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> Vec<(String, f64)> {
    let mut scored: Vec<(String, f64)> = names
        .into_iter()
        .map(|n| (n.to_string(), similarity(query, n)))
        .filter(|(_, s)| *s >= SUGGESTION_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.len().cmp(&b.0.len()))
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(MAX_SUGGESTIONS);
    scored
}

/// The unique best candidate at or above [`RESOLVE_THRESHOLD`], if any.
#[must_use]
pub fn resolve_candidate(ranked: &[(String, f64)]) -> Option<&str> {
    let (best, score) = ranked.first()?;
    if *score < RESOLVE_THRESHOLD {
        return None;
    }
    if let Some((_, second)) = ranked.get(1)
        && (*second - *score).abs() < f64::EPSILON
    {
        return None;
    }
    Some(best.as_str())
}
