//! The multi-phase discovery pipeline: research, query generation, search,
//! ranking, and attempt-with-fallback (including the OAuth consent/retry
//! sub-flow) — spec §3, §4.8.
//!
//! `orchestrator.py::_discover_and_add_server` runs a single query straight
//! through to `get_server`; this module generalizes that into the five
//! phases spec §4.8 calls for, keeping the original's actual mechanics
//! (single-result `search`, `qualifiedName`/`qualified_name` tolerance,
//! silent-fail-on-`RegistryError`) as the innermost step of phase 5.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::GetServerOutcome;
use crate::installer::LocalInstaller;
use crate::oauth;
use crate::registry::{SearchResult, SmitheryClient};
use crate::server_spec::ServerSpec;

const MAX_CANDIDATES: usize = 5;
const RESULTS_PER_QUERY: u32 = 5;

/// Tiered scores per spec §4.8 phase 4 — a qualified-name match always
/// outranks a name match, which always outranks a description match, which
/// always outranks a bare keyword match. Tiers never blend additively.
const SCORE_QUALIFIED_NAME_MATCH: i64 = 100;
const SCORE_NAME_MATCH: i64 = 80;
const SCORE_DESCRIPTION_MATCH: i64 = 60;
const SCORE_KEYWORD_BASE: i64 = 40;
const SCORE_PER_KEYWORD: i64 = 5;

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub qualified_name: String,
    pub score: i64,
}

/// Phase 1 output: what little a research pass (a whole LLM invocation, out
/// of this module's scope) could establish about the capability.
#[derive(Debug, Clone, Default)]
pub struct ResearchResult {
    pub description: Option<String>,
    pub keywords: Vec<String>,
}

impl ResearchResult {
    fn is_empty(&self) -> bool {
        self.description.is_none() && self.keywords.is_empty()
    }
}

pub struct DiscoveryPipeline<'a> {
    registry: &'a SmitheryClient,
    installer: &'a LocalInstaller,
}

/// `AuthorizationRequired` from spec §4.8 is fully absorbed by
/// [`DiscoveryPipeline::handle_oauth_required`]: a decline or a failed
/// exchange just moves on to the next candidate, so by the time `discover`
/// returns there is nothing left to surface but success or exhaustion.
pub enum DiscoveryOutcome {
    Added { alias: String, spec: ServerSpec },
    NotFound,
}

impl<'a> DiscoveryPipeline<'a> {
    pub fn new(registry: &'a SmitheryClient, installer: &'a LocalInstaller) -> Self {
        Self { registry, installer }
    }

    /// Phase 1: a lightweight stand-in for a research sub-agent that would
    /// otherwise browse the web for which product/package serves a
    /// capability. Kept deterministic (no network call of its own) since the
    /// actual research delegate is a whole LLM invocation out of this
    /// module's scope; returns empty, meaning phase 2 falls back to the bare
    /// spec queries.
    fn research(&self, _capability: &str) -> ResearchResult {
        ResearchResult::default()
    }

    /// Phase 2: the three base queries are fixed by spec §4.8 — verbatim,
    /// in this order, never sorted or deduplicated away. Research-derived
    /// queries (a description sentence, a keyword cluster) are appended only
    /// when phase 1 actually found something.
    fn generate_queries(&self, capability: &str, research: &ResearchResult) -> Vec<String> {
        let mut queries = vec![capability.to_string(), format!("{capability} mcp"), format!("{capability} server")];

        if !research.is_empty() {
            if let Some(sentence) = research.description.as_deref().and_then(first_sentence) {
                queries.push(sentence);
            }
            if !research.keywords.is_empty() {
                queries.push(research.keywords.iter().take(3).cloned().collect::<Vec<_>>().join(" "));
            }
        }

        queries
    }

    /// Phase 3: runs every generated query, merging hits and deduplicating
    /// by qualified name (the same server often surfaces under more than one
    /// query).
    async fn search_all(&self, queries: &[String]) -> Vec<SearchResult> {
        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();

        for query in queries {
            match self.registry.search(query, RESULTS_PER_QUERY).await {
                Ok(results) => {
                    for result in results {
                        let Some(name) = result.qualified_name.clone() else { continue };
                        if seen.insert(name) {
                            merged.push(result);
                        }
                    }
                },
                Err(e) => debug!("search for '{query}' failed, continuing with other queries: {e}"),
            }
        }
        merged
    }

    /// Phase 4: tiered, mutually-exclusive integer scoring per spec §4.8 —
    /// a qualified-name substring match always wins over a name match, which
    /// always wins over a description match, which always wins over a bare
    /// research-keyword match. Zero-score candidates are dropped outright.
    fn rank(&self, capability: &str, results: &[SearchResult], research: &ResearchResult) -> Vec<RankedCandidate> {
        let capability_lower = capability.to_lowercase();

        let mut ranked: Vec<RankedCandidate> = results
            .iter()
            .filter_map(|r| {
                let qualified_name = r.qualified_name.clone()?;
                let name = r.name.clone().unwrap_or_default().to_lowercase();
                let description = r.description.clone().unwrap_or_default().to_lowercase();

                let score = if qualified_name.to_lowercase().contains(&capability_lower) {
                    SCORE_QUALIFIED_NAME_MATCH
                } else if name.contains(&capability_lower) {
                    SCORE_NAME_MATCH
                } else if description.contains(&capability_lower) {
                    SCORE_DESCRIPTION_MATCH
                } else {
                    let matches =
                        research.keywords.iter().filter(|kw| description.contains(&kw.to_lowercase())).count() as i64;
                    if matches >= 1 { SCORE_KEYWORD_BASE + SCORE_PER_KEYWORD * matches } else { 0 }
                };

                (score > 0).then_some(RankedCandidate { qualified_name, score })
            })
            .collect();

        ranked.sort_by(|a, b| b.score.cmp(&a.score));
        ranked.truncate(MAX_CANDIDATES);
        ranked
    }

    /// Phase 5: walks ranked candidates best-first, fetching each one's full
    /// metadata, trying local npm installation before falling back to the
    /// hosted registry spec, and running the OAuth consent-and-retry
    /// sub-flow when the registry demands it. The first candidate that
    /// yields a usable spec wins; candidates that error or are declined are
    /// skipped, not fatal.
    pub async fn discover(&self, capability: &str, alias: &str) -> DiscoveryOutcome {
        let research = self.research(capability);
        let queries = self.generate_queries(capability, &research);
        info!("discovery for '{capability}': running {} quer(ies)", queries.len());

        let results = self.search_all(&queries).await;
        if results.is_empty() {
            return DiscoveryOutcome::NotFound;
        }

        let candidates = self.rank(capability, &results, &research);
        if candidates.is_empty() {
            debug!("no candidate for '{capability}' scored above the relevance threshold");
            return DiscoveryOutcome::NotFound;
        }

        for candidate in &candidates {
            match self.attempt_candidate(candidate, alias).await {
                Some(outcome) => return outcome,
                None => continue,
            }
        }

        DiscoveryOutcome::NotFound
    }

    async fn attempt_candidate(&self, candidate: &RankedCandidate, alias: &str) -> Option<DiscoveryOutcome> {
        let metadata = match self.registry.fetch_full_metadata(&candidate.qualified_name).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("could not fetch metadata for '{}': {e}", candidate.qualified_name);
                serde_json::json!({"qualifiedName": candidate.qualified_name})
            },
        };

        if let Ok(Some(spec)) =
            self.installer.attempt_local_installation(&candidate.qualified_name, &metadata, HashMap::new()).await
        {
            info!("installed '{}' locally as '{alias}'", candidate.qualified_name);
            return Some(DiscoveryOutcome::Added { alias: alias.to_string(), spec: ServerSpec::Subprocess(spec) });
        }

        match self.registry.get_server(&candidate.qualified_name).await {
            Ok(GetServerOutcome::Ready(spec)) => {
                info!("added hosted server '{}' as '{alias}'", candidate.qualified_name);
                Some(DiscoveryOutcome::Added { alias: alias.to_string(), spec })
            },
            Ok(GetServerOutcome::OAuthRequired(req)) => {
                self.handle_oauth_required(candidate, alias, &req).await
            },
            Err(e) => {
                debug!("candidate '{}' could not be retrieved: {e}", candidate.qualified_name);
                None
            },
        }
    }

    /// OAuth handler used during phase 5 attempts: pure coordination between
    /// the consent prompt, the PKCE flow, the token store, and a retried
    /// `get_server` call. Never propagates an error — any failure along the
    /// way simply means this candidate doesn't pan out and the caller moves
    /// to the next one.
    async fn handle_oauth_required(
        &self,
        candidate: &RankedCandidate,
        alias: &str,
        req: &crate::error::OAuthRequired,
    ) -> Option<DiscoveryOutcome> {
        if !prompt_oauth_consent(&candidate.qualified_name, &req.authorization_url_base) {
            info!("authorization for '{}' declined", candidate.qualified_name);
            return None;
        }

        let record = match oauth::authorize(req.config.clone(), oauth::DEFAULT_CLIENT_ID, |url| {
            println!("Open this URL to finish authorizing '{}':\n  {url}", candidate.qualified_name);
        })
        .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!("OAuth authorization for '{}' failed: {e}", candidate.qualified_name);
                return None;
            },
        };

        if let Err(e) = self.registry.store_token(&candidate.qualified_name, record).await {
            warn!("failed to persist OAuth token for '{}': {e}", candidate.qualified_name);
            return None;
        }

        match self.registry.get_server(&candidate.qualified_name).await {
            Ok(GetServerOutcome::Ready(spec)) => {
                info!("added hosted server '{}' as '{alias}' after authorization", candidate.qualified_name);
                Some(DiscoveryOutcome::Added { alias: alias.to_string(), spec })
            },
            other => {
                warn!("'{}' still not usable after authorization: {other:?}", candidate.qualified_name);
                None
            },
        }
    }
}

/// Splits off the first sentence of a research description (up to and
/// including the first `.`), falling back to the whole string when there is
/// no sentence boundary.
fn first_sentence(description: &str) -> Option<String> {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.find('.') {
        Some(idx) => Some(trimmed[..=idx].to_string()),
        None => Some(trimmed.to_string()),
    }
}

/// Prompts the user for OAuth consent; accepts `yes`/`y` case-insensitively
/// and with surrounding whitespace stripped (spec §4.8 phase 5), anything
/// else — including EOF — is a decline.
fn prompt_oauth_consent(qualified_name: &str, authorization_url: &str) -> bool {
    println!("'{qualified_name}' requires authorization before it can be used.");
    println!("Visit: {authorization_url}");
    print!("Authorize and continue? [y/N] ");
    let _ = std::io::Write::flush(&mut std::io::stdout());

    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    consent_granted(&answer)
}

fn consent_granted(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
