use crate::definition::DefinitionRegistry;
use crate::error::{GraphApiError, Result};
use crate::paging::{PageResolver, escape_pointer, find_continuations};
use crate::query::{batch_params, field_param, node_params};
use crate::result::CrawlSummary;
use crate::sink::RecordSink;
use crate::transport::GraphClient;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Called before each fetch with the number of queued nodes and a status line.
pub type ProgressCallback = Arc<dyn Fn(usize, String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CrawlTask {
    pub node_id: String,
    pub definition_name: String,
    pub level: u32,
}

impl CrawlTask {
    pub fn new(node_id: impl Into<String>, definition_name: impl Into<String>, level: u32) -> Self {
        Self {
            node_id: node_id.into(),
            definition_name: definition_name.into(),
            level,
        }
    }
}

/// Contiguous queued nodes sharing a type and level, fetched together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBatch {
    pub definition_name: String,
    pub level: u32,
    pub node_ids: Vec<String>,
}

/// How far traversal goes. `max_levels == 0` means unlimited.
#[derive(Debug, Clone, Default)]
pub struct TraversalPolicy {
    pub max_levels: u32,
    pub exclude: HashSet<String>,
}

impl TraversalPolicy {
    pub fn new(max_levels: u32) -> Self {
        Self {
            max_levels,
            exclude: HashSet::new(),
        }
    }

    pub fn with_exclude<I, S>(mut self, exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(exclude.into_iter().map(Into::into));
        self
    }

    /// Whether connections of a node at `level` should be queued.
    pub fn descends_from(&self, level: u32) -> bool {
        self.max_levels == 0 || level < self.max_levels
    }

    pub fn excludes(&self, definition_name: &str) -> bool {
        self.exclude.contains(definition_name)
    }
}

/// Ids and types of the nodes a record links to through followed edges.
///
/// Edges of the record's own type are read at full depth; records nested
/// inside it only through their default edges, since that is all the query
/// asked for.
pub fn discover_connections(
    registry: &DefinitionRegistry,
    definition_name: &str,
    record: &Value,
) -> Result<Vec<(String, String)>> {
    let mut found = Vec::new();
    collect_connections(registry, definition_name, record, true, &mut found)?;
    Ok(found)
}

fn collect_connections(
    registry: &DefinitionRegistry,
    definition_name: &str,
    fragment: &Value,
    full_depth: bool,
    found: &mut Vec<(String, String)>,
) -> Result<()> {
    let definition = registry.get(definition_name)?;
    for edge in definition.edges(full_depth) {
        if !definition.follow_edge(edge) {
            continue;
        }
        let (Some(edge_type), Some(value)) = (definition.edge_type(edge), fragment.get(edge)) else {
            continue;
        };
        let nodes: Vec<&Value> = match value.get("data").and_then(Value::as_array) {
            Some(items) => items.iter().collect(),
            None => vec![value],
        };
        for node in nodes {
            if let Some(id) = node.get("id").and_then(Value::as_str) {
                found.push((id.to_string(), edge_type.to_string()));
            }
            collect_connections(registry, edge_type, node, false, found)?;
        }
    }
    Ok(())
}

/// The mutable traversal state of one run: the FIFO queue, every node id
/// ever queued with its type, and per-type counts of queued nodes.
#[derive(Debug, Clone, Default)]
pub struct CrawlState {
    pub queue: VecDeque<CrawlTask>,
    pub visited: HashMap<String, String>,
    pub pending_by_type: HashMap<String, usize>,
}

impl CrawlState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a root node at level 1. Returns false if it was already seen.
    pub fn seed(&mut self, node_id: &str, definition_name: &str) -> bool {
        self.push(CrawlTask::new(node_id, definition_name, 1))
    }

    pub fn push(&mut self, task: CrawlTask) -> bool {
        if self.visited.contains_key(&task.node_id) {
            return false;
        }
        self.visited
            .insert(task.node_id.clone(), task.definition_name.clone());
        *self
            .pending_by_type
            .entry(task.definition_name.clone())
            .or_default() += 1;
        self.queue.push_back(task);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_visited(&self, node_id: &str) -> bool {
        self.visited.contains_key(node_id)
    }

    /// Queues connections found at `level` as level + 1, skipping visited ids
    /// and excluded types. Returns how many were added.
    pub fn enqueue_connections(
        &mut self,
        connections: Vec<(String, String)>,
        level: u32,
        policy: &TraversalPolicy,
    ) -> usize {
        let mut added = 0;
        for (node_id, definition_name) in connections {
            if policy.excludes(&definition_name) {
                continue;
            }
            if self.push(CrawlTask::new(node_id, definition_name, level + 1)) {
                added += 1;
            }
        }
        added
    }

    /// Queues the connections of a completed record, when its level allows.
    pub fn absorb(
        &mut self,
        registry: &DefinitionRegistry,
        policy: &TraversalPolicy,
        definition_name: &str,
        level: u32,
        record: &Value,
    ) -> Result<usize> {
        if !policy.descends_from(level) {
            return Ok(0);
        }
        let connections = discover_connections(registry, definition_name, record)?;
        let found = connections.len();
        let added = self.enqueue_connections(connections, level, policy);
        let node_id = record.get("id").and_then(Value::as_str).unwrap_or("?");
        debug!(
            "{} connected nodes found in {} and {} added to node queue.",
            found, node_id, added
        );
        Ok(added)
    }

    /// Pops the longest run at the queue front sharing type and level, capped
    /// at the type's batch size.
    pub fn next_batch(&mut self, registry: &DefinitionRegistry) -> Result<Option<NodeBatch>> {
        let Some(first) = self.queue.pop_front() else {
            return Ok(None);
        };
        let definition = registry.get(&first.definition_name)?;

        let mut node_ids = vec![first.node_id];
        while node_ids.len() < definition.node_batch_size {
            match self.queue.front() {
                Some(next)
                    if next.definition_name == first.definition_name && next.level == first.level => {}
                _ => break,
            }
            if let Some(task) = self.queue.pop_front() {
                node_ids.push(task.node_id);
            }
        }

        if let Some(count) = self.pending_by_type.get_mut(&first.definition_name) {
            *count = count.saturating_sub(node_ids.len());
        }
        Ok(Some(NodeBatch {
            definition_name: first.definition_name,
            level: first.level,
            node_ids,
        }))
    }

    /// Queued counts per type, largest first.
    pub fn pending_summary(&self) -> String {
        let mut counts: Vec<(&String, &usize)> = self
            .pending_by_type
            .iter()
            .filter(|(_, count)| **count > 0)
            .collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        counts
            .iter()
            .map(|(name, count)| format!("{}={}", name, count))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Breadth-first crawler over the graph API.
pub struct Crawler {
    client: GraphClient,
    registry: Arc<DefinitionRegistry>,
    policy: TraversalPolicy,
    progress_callback: Option<ProgressCallback>,
    page_batching: bool,
}

impl Crawler {
    pub fn new(client: GraphClient, registry: Arc<DefinitionRegistry>) -> Self {
        Self {
            client,
            registry,
            policy: TraversalPolicy::new(1),
            progress_callback: None,
            page_batching: true,
        }
    }

    pub fn with_max_levels(mut self, max_levels: u32) -> Self {
        self.policy.max_levels = max_levels;
        self
    }

    pub fn with_exclude<I, S>(mut self, exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy = self.policy.with_exclude(exclude);
        self
    }

    pub fn with_policy(mut self, policy: TraversalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn with_page_batching(mut self, page_batching: bool) -> Self {
        self.page_batching = page_batching;
        self
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &TraversalPolicy {
        &self.policy
    }

    /// Crawls outward from a single root node.
    pub async fn crawl(
        &self,
        node_id: &str,
        definition_name: &str,
        sinks: &mut [&mut dyn RecordSink],
    ) -> Result<CrawlSummary> {
        // Fail on an unknown type before any request is made.
        self.registry.get(definition_name)?;
        let mut state = CrawlState::new();
        state.seed(node_id, definition_name);
        self.run(&mut state, sinks).await
    }

    /// Drains `state`'s queue, emitting every fetched record to all sinks.
    pub async fn run(
        &self,
        state: &mut CrawlState,
        sinks: &mut [&mut dyn RecordSink],
    ) -> Result<CrawlSummary> {
        let mut summary = CrawlSummary::default();
        let requests_before = self.client.request_count();

        while let Some(batch) = state.next_batch(&self.registry)? {
            info!(
                "Getting nodes {:?} ({}). {} nodes left: {}",
                batch.node_ids,
                batch.definition_name,
                state.queue.len(),
                state.pending_summary()
            );
            if let Some(ref callback) = self.progress_callback {
                callback(
                    state.queue.len(),
                    format!(
                        "{} {} node(s) at level {}",
                        batch.node_ids.len(),
                        batch.definition_name,
                        batch.level
                    ),
                );
            }

            let records = if batch.node_ids.len() == 1 {
                let node_id = &batch.node_ids[0];
                self.fetch_node_or_skip(node_id, &batch.definition_name, &mut summary)
                    .await?
                    .map(|record| vec![record])
                    .unwrap_or_default()
            } else {
                self.fetch_many(&batch.node_ids, &batch.definition_name, &mut summary)
                    .await?
            };

            for record in records {
                for sink in sinks.iter_mut() {
                    sink.write_record(&record)?;
                }
                summary.record_emitted(&batch.definition_name);
                state.absorb(
                    &self.registry,
                    &self.policy,
                    &batch.definition_name,
                    batch.level,
                    &record,
                )?;
            }
        }

        summary.requests = self.client.request_count() - requests_before;
        info!(
            "Crawl complete. {} nodes emitted, {} skipped, {} requests",
            summary.emitted, summary.skipped, summary.requests
        );
        Ok(summary)
    }

    /// Fetches one node at full depth with all pages resolved.
    ///
    /// If the API rejects the request with an error code the definition lists
    /// omittable fields for, the request is retried once without them.
    pub async fn fetch_node(&self, node_id: &str, definition_name: &str) -> Result<Value> {
        let error = match self.fetch_node_omitting(node_id, definition_name, None).await {
            Ok(record) => return Ok(record),
            Err(e) => e,
        };
        let definition = self.registry.get(definition_name)?;
        match error.api_error().map(|api| api.code) {
            Some(code) if definition.omits_on(code) => {
                info!(
                    "Getting node {} ({}), omitting fields for error {}",
                    node_id, definition_name, code
                );
                self.fetch_node_omitting(node_id, definition_name, Some(code))
                    .await
            }
            _ => Err(error),
        }
    }

    /// Fetches several nodes of one type in a single request. Nodes missing
    /// from the response are left out of the result.
    pub async fn fetch_batch(
        &self,
        node_ids: &[String],
        definition_name: &str,
    ) -> Result<Vec<Value>> {
        let fields = field_param(&self.registry, definition_name, true, None)?;
        let mut params = batch_params(node_ids, fields);
        // POST because the field list can outgrow a query string.
        params.push(("method".to_string(), "GET".to_string()));
        let mut response = self.client.post(self.client.base_url(), &params, true).await?;

        let mut pending = Vec::new();
        let mut present = Vec::new();
        for node_id in node_ids {
            match response.get_mut(node_id.as_str()) {
                Some(record) if record.is_object() => {
                    pending.extend(find_continuations(
                        record,
                        &format!("/{}", escape_pointer(node_id)),
                    ));
                    present.push(node_id);
                }
                _ => warn!("Node {} is missing or not permitted, so skipping.", node_id),
            }
        }
        self.page_resolver().resolve(&mut response, pending).await?;

        Ok(present
            .into_iter()
            .filter_map(|node_id| response.get_mut(node_id.as_str()).map(Value::take))
            .collect())
    }

    async fn fetch_node_omitting(
        &self,
        node_id: &str,
        definition_name: &str,
        omit_for_error: Option<i64>,
    ) -> Result<Value> {
        let fields = field_param(&self.registry, definition_name, true, omit_for_error)?;
        let mut params = node_params(fields);
        params.push(("method".to_string(), "GET".to_string()));
        let mut record = self
            .client
            .post(&self.client.node_url(node_id), &params, true)
            .await?;

        let pending = find_continuations(&mut record, "");
        self.page_resolver().resolve(&mut record, pending).await?;
        Ok(record)
    }

    async fn fetch_node_or_skip(
        &self,
        node_id: &str,
        definition_name: &str,
        summary: &mut CrawlSummary,
    ) -> Result<Option<Value>> {
        match self.fetch_node(node_id, definition_name).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.api_error().is_some_and(GraphApiError::is_unsupported_request) => {
                warn!("Skipping {} due to unsupported request: {}", node_id, e);
                summary.skipped += 1;
                Ok(None)
            }
            Err(e) => Err(e.for_node(node_id)),
        }
    }

    async fn fetch_many(
        &self,
        node_ids: &[String],
        definition_name: &str,
        summary: &mut CrawlSummary,
    ) -> Result<Vec<Value>> {
        let definition = self.registry.get(definition_name)?;
        let error = match self.fetch_batch(node_ids, definition_name).await {
            Ok(records) => {
                summary.skipped += node_ids.len() - records.len();
                return Ok(records);
            }
            Err(e) => e,
        };

        let degrade = error.api_error().is_some_and(|api| {
            api.is_too_much_data() || api.is_unsupported_request() || definition.omits_on(api.code)
        });
        if !degrade {
            return Err(error.for_node(node_ids.join(",")));
        }

        warn!(
            "Batch of {} {} nodes failed ({}), trying one node at a time.",
            node_ids.len(),
            definition_name,
            error
        );
        let mut records = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            info!("Getting node {} ({})", node_id, definition_name);
            if let Some(record) = self
                .fetch_node_or_skip(node_id, definition_name, summary)
                .await?
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn page_resolver(&self) -> PageResolver<'_> {
        PageResolver::new(&self.client).with_batching(self.page_batching)
    }
}
