//! Completes paginated collections inside fetched records.
//!
//! Works purely on structure: any object holding a `data` array next to a
//! `paging` block is a collection, whether or not a definition declares it.

use crate::error::{Result, ScanError};
use crate::transport::GraphClient;
use serde_json::{Value, json};
use std::collections::VecDeque;
use tracing::{debug, error, warn};
use url::Url;

/// Maximum number of continuations fetched in one combined request.
pub const PAGE_BATCH_SIZE: usize = 50;

/// A continuation link and the JSON pointer of the `data` array it extends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPage {
    pub next: String,
    pub target: String,
}

/// Escapes one JSON pointer reference token.
pub fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Detaches every `paging` block found under `fragment` and returns the
/// continuations they carried. `pointer` is the location of `fragment` inside
/// the document that pages will later be merged into.
pub fn find_continuations(fragment: &mut Value, pointer: &str) -> Vec<PendingPage> {
    let mut pending = Vec::new();
    collect(fragment, pointer, &mut pending);
    pending
}

fn collect(fragment: &mut Value, pointer: &str, pending: &mut Vec<PendingPage>) {
    match fragment {
        Value::Object(map) => {
            if map.get("data").is_some_and(Value::is_array)
                && let Some(paging) = map.remove("paging")
                && let Some(next) = paging.get("next").and_then(Value::as_str)
            {
                pending.push(PendingPage {
                    next: next.to_string(),
                    target: format!("{}/data", pointer),
                });
            }
            for (key, value) in map.iter_mut() {
                collect(value, &format!("{}/{}", pointer, escape_pointer(key)), pending);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                collect(item, &format!("{}/{}", pointer, index), pending);
            }
        }
        _ => {}
    }
}

/// Appends a fetched page to the array at `target` and returns the
/// continuations it introduces.
fn merge_page(root: &mut Value, target: &str, mut page: Value) -> Vec<PendingPage> {
    let mut pending = Vec::new();
    let next = page
        .get("paging")
        .and_then(|paging| paging.get("next"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(Value::Array(items)) = page.get_mut("data").map(Value::take) else {
        warn!("Page for {} has no data, ignoring", target);
        return pending;
    };
    let Some(Value::Array(container)) = root.pointer_mut(target) else {
        warn!("Page target {} is not a list, ignoring", target);
        return pending;
    };

    if let Some(next) = next {
        pending.push(PendingPage {
            next,
            target: target.to_string(),
        });
    }
    let offset = container.len();
    for (index, mut item) in items.into_iter().enumerate() {
        pending.extend(find_continuations(
            &mut item,
            &format!("{}/{}", target, offset + index),
        ));
        container.push(item);
    }
    pending
}

pub struct PageResolver<'a> {
    client: &'a GraphClient,
    batch_size: usize,
    batching: bool,
}

impl<'a> PageResolver<'a> {
    pub fn new(client: &'a GraphClient) -> Self {
        Self {
            client,
            batch_size: PAGE_BATCH_SIZE,
            batching: true,
        }
    }

    /// When disabled every page is fetched with its own request.
    pub fn with_batching(mut self, batching: bool) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Fetches every pending page (and the pages they lead to) and merges the
    /// results into `root`. Returns the number of pages merged.
    ///
    /// A page that cannot be fetched on its own is dropped with a warning; a
    /// failed combined request fails the whole resolution.
    pub async fn resolve(&self, root: &mut Value, pending: Vec<PendingPage>) -> Result<usize> {
        let mut queue: VecDeque<PendingPage> = pending.into();
        let mut merged = 0;

        while !queue.is_empty() {
            let take = if self.batching {
                self.batch_size.min(queue.len())
            } else {
                1
            };
            let pages: Vec<PendingPage> = queue.drain(..take).collect();
            let bodies = if pages.len() > 1 {
                self.fetch_batch(&pages).await?
            } else {
                vec![self.fetch_single(&pages[0]).await]
            };

            for (page, body) in pages.iter().zip(bodies) {
                if let Some(body) = body {
                    queue.extend(merge_page(root, &page.target, body));
                    merged += 1;
                }
            }
        }

        Ok(merged)
    }

    async fn fetch_batch(&self, pages: &[PendingPage]) -> Result<Vec<Option<Value>>> {
        debug!("Getting batch with {} pages", pages.len());
        let batch: Vec<Value> = pages
            .iter()
            .map(|page| json!({"method": "GET", "relative_url": self.relative_url(&page.next)}))
            .collect();
        let params = vec![
            ("batch".to_string(), serde_json::to_string(&batch)?),
            ("include_headers".to_string(), "false".to_string()),
        ];
        let response = self.client.post(self.client.base_url(), &params, true).await?;
        let items = response
            .as_array()
            .ok_or_else(|| ScanError::Parse("batch response is not a list".to_string()))?;

        let mut bodies = Vec::with_capacity(pages.len());
        for (index, page) in pages.iter().enumerate() {
            let item = items.get(index).filter(|item| !item.is_null());
            let body = item
                .filter(|item| item.get("code").and_then(Value::as_u64) == Some(200))
                .and_then(|item| item.get("body").and_then(Value::as_str))
                .and_then(|body| serde_json::from_str::<Value>(body).ok());
            match body {
                Some(body) => bodies.push(Some(body)),
                None => {
                    let reply = item
                        .map(Value::to_string)
                        .unwrap_or_else(|| "no response".to_string());
                    error!("Error for page {} in batch: {}", page.next, reply);
                    bodies.push(self.fetch_single(page).await);
                }
            }
        }
        Ok(bodies)
    }

    async fn fetch_single(&self, page: &PendingPage) -> Option<Value> {
        // Continuation links already carry the token.
        match self.client.get(&page.next, &[], false).await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("Ignoring error on page {}: {}", page.next, e);
                None
            }
        }
    }

    fn relative_url(&self, link: &str) -> String {
        if let Some(rest) = link.strip_prefix(self.client.base_url()) {
            return rest.trim_start_matches('/').to_string();
        }
        match Url::parse(link) {
            Ok(url) => {
                let path = url.path().trim_start_matches('/');
                match url.query() {
                    Some(query) => format!("{}?{}", path, query),
                    None => path.to_string(),
                }
            }
            Err(_) => link.to_string(),
        }
    }
}
