//! Tool registry with BM25-ranked search.
//!
//! Holds every tool built for an agent and answers `search_tools`
//! queries. The index is rebuilt on registration; lookups by exact name
//! back the graph's dynamic tool binding.

use std::collections::HashMap;
use std::sync::Arc;

use bm25::{Document, Language, SearchEngine, SearchEngineBuilder};
use parking_lot::RwLock;

use super::tools::AgentTool;

#[derive(Default)]
struct RegistryIndex {
    tools: HashMap<String, Arc<AgentTool>>,
    /// Insertion order, doubling as BM25 document IDs.
    names: Vec<String>,
    engine: Option<SearchEngine<usize>>,
}

/// Registry for managing and searching tools.
#[derive(Default)]
pub struct ToolRegistry {
    index: RwLock<RegistryIndex>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register tools and rebuild the search index.
    pub fn register(&self, tools: &[Arc<AgentTool>]) {
        let mut index = self.index.write();
        for tool in tools {
            let name = tool.name().to_string();
            if index.tools.insert(name.clone(), tool.clone()).is_none() {
                index.names.push(name);
            }
        }
        Self::rebuild(&mut index);
    }

    fn rebuild(index: &mut RegistryIndex) {
        if index.names.is_empty() {
            index.engine = None;
            return;
        }
        let documents: Vec<Document<usize>> = index
            .names
            .iter()
            .enumerate()
            .map(|(id, name)| {
                let tool = &index.tools[name];
                Document::new(id, format!("{name} {}", tool.definition.description))
            })
            .collect();
        index.engine =
            Some(SearchEngineBuilder::<usize>::with_documents(Language::English, documents).build());
    }

    /// BM25 search over tool name + description. Only positive-score
    /// matches are returned.
    pub fn search(&self, query: &str, limit: usize) -> Vec<Arc<AgentTool>> {
        let index = self.index.read();
        let Some(engine) = &index.engine else {
            return Vec::new();
        };
        engine
            .search(query, limit)
            .into_iter()
            .filter(|result| result.score > 0.0)
            .filter_map(|result| {
                index
                    .names
                    .get(result.document.id)
                    .and_then(|name| index.tools.get(name))
                    .cloned()
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentTool>> {
        self.index.read().tools.get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<AgentTool>> {
        let index = self.index.read();
        index
            .names
            .iter()
            .filter_map(|name| index.tools.get(name).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().names.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use tb_domain::error::Result;
    use tb_domain::tool::ToolDefinition;

    fn tool(name: &str, description: &str) -> Arc<AgentTool> {
        let invoke: Arc<
            dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<String>> + Send + Sync,
        > = Arc::new(|_| Box::pin(async { Ok(String::new()) }));
        Arc::new(AgentTool::new(
            ToolDefinition {
                name: name.into(),
                description: description.into(),
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
            },
            "Test",
            name,
            invoke,
        ))
    }

    #[test]
    fn search_ranks_relevant_tools_first() {
        let registry = ToolRegistry::new();
        registry.register(&[
            tool("Weather_get_weather", "Get the current weather for a city"),
            tool("Files_read_file", "Read the contents of a file from disk"),
            tool("Notion_search_pages", "Search pages in a Notion workspace"),
        ]);

        let results = registry.search("current weather", 5);
        assert!(!results.is_empty());
        assert_eq!(results[0].name(), "Weather_get_weather");
    }

    #[test]
    fn search_respects_limit() {
        let registry = ToolRegistry::new();
        registry.register(&[
            tool("A_search", "search things"),
            tool("B_search", "search stuff"),
            tool("C_search", "search items"),
        ]);
        assert!(registry.search("search", 2).len() <= 2);
    }

    #[test]
    fn empty_registry_returns_nothing() {
        let registry = ToolRegistry::new();
        assert!(registry.search("anything", 5).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn get_by_exact_name() {
        let registry = ToolRegistry::new();
        registry.register(&[tool("Weather_get_weather", "weather")]);
        assert!(registry.get("Weather_get_weather").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn reregistering_same_name_replaces_without_duplicating() {
        let registry = ToolRegistry::new();
        registry.register(&[tool("A_x", "one")]);
        registry.register(&[tool("A_x", "two")]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("A_x").unwrap().definition.description, "two");
    }
}
