//! Merged catalog: namespacing, lookup, and the reserved management tools.
//!
//! Tools and prompts are exposed as `"<upstream>.<original>"`, resources as
//! `"<upstream>://<original-uri>"`. The original bytes after the first
//! separator are preserved verbatim, so splitting on the first separator
//! reverses the wrapping exactly even when the original contains one.

use parking_lot::RwLock;
use rmcp::model::{Prompt, Resource, Tool};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

pub const TOOL_LIST_SERVERS: &str = "list_servers";
pub const TOOL_GET_SERVER_INFO: &str = "get_server_info";

const RESOURCE_SEPARATOR: &str = "://";

pub fn namespaced_tool_name(upstream: &str, original: &str) -> String {
    format!("{upstream}.{original}")
}

pub fn namespaced_resource_uri(upstream: &str, original: &str) -> String {
    format!("{upstream}{RESOURCE_SEPARATOR}{original}")
}

pub fn split_tool_name(public: &str) -> Option<(&str, &str)> {
    public.split_once('.')
}

pub fn split_resource_uri(public: &str) -> Option<(&str, &str)> {
    public.split_once(RESOURCE_SEPARATOR)
}

/// Outcome of resolving a public name to an upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Routed { upstream: String, original: String },
    /// The unprefixed name exists on several upstreams; candidates are the
    /// unambiguous namespaced forms.
    Ambiguous { candidates: Vec<String> },
    Missing,
}

/// One upstream's catalog contribution, with original (un-namespaced) names.
pub struct UpstreamCatalog {
    pub name: String,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

struct OwnedTool {
    upstream: String,
    tool: Tool,
}

struct OwnedResource {
    upstream: String,
    resource: Resource,
}

struct OwnedPrompt {
    upstream: String,
    prompt: Prompt,
}

/// An immutable merged view over all upstream catalogs.
#[derive(Default)]
pub struct CatalogSnapshot {
    upstream_names: BTreeSet<String>,
    tools: Vec<OwnedTool>,
    resources: Vec<OwnedResource>,
    prompts: Vec<OwnedPrompt>,
}

impl CatalogSnapshot {
    /// Merge per-upstream contributions. Collisions on an exposed name are
    /// impossible given the reserved separators; duplicates within one
    /// upstream's list are skipped with a warning.
    pub fn build(contributions: Vec<UpstreamCatalog>) -> Self {
        let mut snapshot = Self::default();
        let mut seen_tools: HashSet<String> = HashSet::new();
        let mut seen_resources: HashSet<String> = HashSet::new();
        let mut seen_prompts: HashSet<String> = HashSet::new();

        for contribution in contributions {
            let upstream = contribution.name;
            snapshot.upstream_names.insert(upstream.clone());

            for tool in contribution.tools {
                let exposed = namespaced_tool_name(&upstream, &tool.name);
                if !seen_tools.insert(exposed.clone()) {
                    tracing::warn!(%upstream, tool = %tool.name, "duplicate exposed tool name; skipping");
                    continue;
                }
                snapshot.tools.push(OwnedTool {
                    upstream: upstream.clone(),
                    tool,
                });
            }
            for resource in contribution.resources {
                let exposed = namespaced_resource_uri(&upstream, &resource.uri);
                if !seen_resources.insert(exposed.clone()) {
                    tracing::warn!(%upstream, uri = %resource.uri, "duplicate exposed resource uri; skipping");
                    continue;
                }
                snapshot.resources.push(OwnedResource {
                    upstream: upstream.clone(),
                    resource,
                });
            }
            for prompt in contribution.prompts {
                let exposed = namespaced_tool_name(&upstream, &prompt.name);
                if !seen_prompts.insert(exposed.clone()) {
                    tracing::warn!(%upstream, prompt = %prompt.name, "duplicate exposed prompt name; skipping");
                    continue;
                }
                snapshot.prompts.push(OwnedPrompt {
                    upstream: upstream.clone(),
                    prompt,
                });
            }
        }

        snapshot
    }

    pub fn upstream_names(&self) -> &BTreeSet<String> {
        &self.upstream_names
    }

    /// Tools as clients see them: the two management tools plus every
    /// upstream tool under its namespaced name.
    pub fn exposed_tools(&self) -> Vec<Tool> {
        let mut out = management_tools();
        out.extend(self.tools.iter().map(|t| {
            let mut tool = t.tool.clone();
            tool.name = namespaced_tool_name(&t.upstream, &t.tool.name).into();
            tool
        }));
        out
    }

    pub fn exposed_resources(&self) -> Vec<Resource> {
        self.resources
            .iter()
            .map(|r| {
                let mut resource = r.resource.clone();
                resource.uri = namespaced_resource_uri(&r.upstream, &r.resource.uri);
                resource
            })
            .collect()
    }

    pub fn exposed_prompts(&self) -> Vec<Prompt> {
        self.prompts
            .iter()
            .map(|p| {
                let mut prompt = p.prompt.clone();
                prompt.name = namespaced_tool_name(&p.upstream, &p.prompt.name);
                prompt
            })
            .collect()
    }

    /// (tools, resources, prompts) contributed by one upstream.
    pub fn counts(&self, upstream: &str) -> (usize, usize, usize) {
        (
            self.tools.iter().filter(|t| t.upstream == upstream).count(),
            self.resources
                .iter()
                .filter(|r| r.upstream == upstream)
                .count(),
            self.prompts
                .iter()
                .filter(|p| p.upstream == upstream)
                .count(),
        )
    }

    pub fn tools_of(&self, upstream: &str) -> Vec<Tool> {
        self.tools
            .iter()
            .filter(|t| t.upstream == upstream)
            .map(|t| t.tool.clone())
            .collect()
    }

    pub fn resources_of(&self, upstream: &str) -> Vec<Resource> {
        self.resources
            .iter()
            .filter(|r| r.upstream == upstream)
            .map(|r| r.resource.clone())
            .collect()
    }

    pub fn prompts_of(&self, upstream: &str) -> Vec<Prompt> {
        self.prompts
            .iter()
            .filter(|p| p.upstream == upstream)
            .map(|p| p.prompt.clone())
            .collect()
    }

    pub fn resolve_tool(&self, public: &str) -> Resolution {
        if let Some((prefix, rest)) = split_tool_name(public)
            && self.upstream_names.contains(prefix)
        {
            return routed(prefix, rest);
        }
        let matches: Vec<(&str, &str)> = self
            .tools
            .iter()
            .filter(|t| t.tool.name.as_ref() == public)
            .map(|t| (t.upstream.as_str(), t.tool.name.as_ref()))
            .collect();
        resolve_matches(&matches, namespaced_tool_name)
    }

    pub fn resolve_prompt(&self, public: &str) -> Resolution {
        if let Some((prefix, rest)) = split_tool_name(public)
            && self.upstream_names.contains(prefix)
        {
            return routed(prefix, rest);
        }
        let matches: Vec<(&str, &str)> = self
            .prompts
            .iter()
            .filter(|p| p.prompt.name == public)
            .map(|p| (p.upstream.as_str(), p.prompt.name.as_str()))
            .collect();
        resolve_matches(&matches, namespaced_tool_name)
    }

    pub fn resolve_resource(&self, public: &str) -> Resolution {
        if let Some((prefix, rest)) = split_resource_uri(public)
            && self.upstream_names.contains(prefix)
        {
            return routed(prefix, rest);
        }
        let matches: Vec<(&str, &str)> = self
            .resources
            .iter()
            .filter(|r| r.resource.uri == public)
            .map(|r| (r.upstream.as_str(), r.resource.uri.as_str()))
            .collect();
        resolve_matches(&matches, namespaced_resource_uri)
    }

    /// A few exposed tool names for "unknown target" error suggestions.
    pub fn tool_suggestions(&self, limit: usize) -> Vec<String> {
        let mut names: Vec<String> = vec![TOOL_LIST_SERVERS.into(), TOOL_GET_SERVER_INFO.into()];
        names.extend(
            self.tools
                .iter()
                .take(limit.saturating_sub(names.len()))
                .map(|t| namespaced_tool_name(&t.upstream, &t.tool.name)),
        );
        names
    }
}

fn routed(upstream: &str, original: &str) -> Resolution {
    Resolution::Routed {
        upstream: upstream.to_string(),
        original: original.to_string(),
    }
}

/// Split-on-first-separator already failed; decide by unique original-name
/// lookup across all upstreams.
fn resolve_matches(matches: &[(&str, &str)], join: fn(&str, &str) -> String) -> Resolution {
    match matches {
        [] => Resolution::Missing,
        [(upstream, original)] => routed(upstream, original),
        many => Resolution::Ambiguous {
            candidates: many.iter().map(|(u, n)| join(u, n)).collect(),
        },
    }
}

/// The two reserved tools that are always present, even with zero upstreams.
pub fn management_tools() -> Vec<Tool> {
    let list_schema = serde_json::json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false,
    });
    let info_schema = serde_json::json!({
        "type": "object",
        "properties": {
            "serverName": { "type": "string", "description": "Configured upstream name" }
        },
        "required": ["serverName"],
        "additionalProperties": false,
    });

    vec![
        Tool::new(
            TOOL_LIST_SERVERS,
            "List the aggregated upstream MCP servers with their transport kind and tool/resource/prompt counts.",
            Arc::new(list_schema.as_object().cloned().unwrap_or_default()),
        ),
        Tool::new(
            TOOL_GET_SERVER_INFO,
            "Return the full cached catalog (tools, resources, prompts) of one upstream server.",
            Arc::new(info_schema.as_object().cloned().unwrap_or_default()),
        ),
    ]
}

/// Shared catalog handle: read-mostly, swapped wholesale on rebuild.
#[derive(Default)]
pub struct Catalog {
    snapshot: RwLock<Arc<CatalogSnapshot>>,
}

impl Catalog {
    pub fn store(&self, snapshot: CatalogSnapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{AnnotateAble, RawResource};

    fn tool(name: &str) -> Tool {
        Tool::new(
            name.to_string(),
            "a test tool",
            Arc::new(serde_json::Map::new()),
        )
    }

    fn resource(uri: &str) -> Resource {
        RawResource::new(uri, uri.to_string()).no_annotation()
    }

    fn prompt(name: &str) -> Prompt {
        Prompt::new(name, Some("a test prompt"), None)
    }

    fn snapshot() -> CatalogSnapshot {
        CatalogSnapshot::build(vec![
            UpstreamCatalog {
                name: "alpha".into(),
                tools: vec![tool("read"), tool("write")],
                resources: vec![resource("file:///etc/hosts")],
                prompts: vec![prompt("review")],
            },
            UpstreamCatalog {
                name: "beta".into(),
                tools: vec![tool("read")],
                resources: vec![],
                prompts: vec![],
            },
        ])
    }

    #[test]
    fn exposed_tools_are_namespaced_plus_management() {
        let snap = snapshot();
        let names: Vec<String> = snap
            .exposed_tools()
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert!(names.contains(&"alpha.read".to_string()));
        assert!(names.contains(&"beta.read".to_string()));
        assert!(names.contains(&TOOL_LIST_SERVERS.to_string()));
        assert!(names.contains(&TOOL_GET_SERVER_INFO.to_string()));
        // sum of upstream tools + the two management tools
        assert_eq!(names.len(), 3 + 2);
        // every non-management name is "<upstream>."-shaped
        for name in &names {
            assert!(
                name.contains('.')
                    || name == TOOL_LIST_SERVERS
                    || name == TOOL_GET_SERVER_INFO,
                "unexpected exposed name {name}"
            );
        }
    }

    #[test]
    fn resource_uri_wrapping_round_trips_inner_scheme() {
        let original = "file:///var/data?q=1";
        let exposed = namespaced_resource_uri("alpha", original);
        assert_eq!(exposed, "alpha://file:///var/data?q=1");
        let (upstream, rest) = split_resource_uri(&exposed).expect("split");
        assert_eq!(upstream, "alpha");
        assert_eq!(rest, original);
    }

    #[test]
    fn prefixed_names_route_to_the_named_upstream() {
        let snap = snapshot();
        assert_eq!(
            snap.resolve_tool("alpha.read"),
            Resolution::Routed {
                upstream: "alpha".into(),
                original: "read".into()
            }
        );
        // prefix wins even when the remainder itself contains a dot
        assert_eq!(
            snap.resolve_tool("alpha.ns.tool"),
            Resolution::Routed {
                upstream: "alpha".into(),
                original: "ns.tool".into()
            }
        );
    }

    #[test]
    fn unprefixed_unique_name_routes() {
        let snap = snapshot();
        assert_eq!(
            snap.resolve_tool("write"),
            Resolution::Routed {
                upstream: "alpha".into(),
                original: "write".into()
            }
        );
    }

    #[test]
    fn unprefixed_shared_name_is_ambiguous_with_candidates() {
        let snap = snapshot();
        match snap.resolve_tool("read") {
            Resolution::Ambiguous { candidates } => {
                assert!(candidates.contains(&"alpha.read".to_string()));
                assert!(candidates.contains(&"beta.read".to_string()));
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn unknown_names_are_missing() {
        let snap = snapshot();
        assert_eq!(snap.resolve_tool("nope"), Resolution::Missing);
        assert_eq!(snap.resolve_resource("nope://x"), Resolution::Missing);
        assert_eq!(snap.resolve_prompt("nope"), Resolution::Missing);
    }

    #[test]
    fn resource_resolution_splits_on_first_separator() {
        let snap = snapshot();
        assert_eq!(
            snap.resolve_resource("alpha://file:///etc/hosts"),
            Resolution::Routed {
                upstream: "alpha".into(),
                original: "file:///etc/hosts".into()
            }
        );
        // unwrapped original URI still resolves uniquely
        assert_eq!(
            snap.resolve_resource("file:///etc/hosts"),
            Resolution::Routed {
                upstream: "alpha".into(),
                original: "file:///etc/hosts".into()
            }
        );
    }

    #[test]
    fn duplicate_entries_within_one_upstream_are_skipped() {
        let snap = CatalogSnapshot::build(vec![UpstreamCatalog {
            name: "a".into(),
            tools: vec![tool("t"), tool("t")],
            resources: vec![],
            prompts: vec![],
        }]);
        assert_eq!(snap.counts("a"), (1, 0, 0));
    }

    #[test]
    fn counts_are_per_upstream() {
        let snap = snapshot();
        assert_eq!(snap.counts("alpha"), (2, 1, 1));
        assert_eq!(snap.counts("beta"), (1, 0, 0));
        assert_eq!(snap.counts("ghost"), (0, 0, 0));
    }

    #[test]
    fn catalog_swaps_snapshots_atomically() {
        let catalog = Catalog::default();
        assert!(catalog.snapshot().upstream_names().is_empty());
        catalog.store(snapshot());
        assert_eq!(catalog.snapshot().upstream_names().len(), 2);
    }
}
