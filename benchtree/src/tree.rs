//! Boundary to the remote B+-tree.

use std::collections::BTreeMap;

use crate::engine::CoroContext;
use crate::request::{Key, Request, Value};
use crate::transport::Endpoint;

/// Index reachable through one-sided operations.
///
/// Operations borrow arena slots from `ctx` for each round trip and await
/// the completions they post; they never block the thread.
#[allow(async_fn_in_trait)]
pub trait TreeIndex: Sync {
    type Endpoint: Endpoint;

    /// Set up transport resources for the calling OS thread.
    fn register_thread(&self, thread_id: usize) -> Self::Endpoint;

    async fn search(&self, key: &Key, ctx: &mut CoroContext<'_, Self::Endpoint>) -> Option<Value>;

    /// Insert, or overwrite the value of an existing key.
    async fn insert(&self, key: &Key, value: Value, ctx: &mut CoroContext<'_, Self::Endpoint>);

    /// Entries with `low <= key < high`, in key order.
    async fn range_query(
        &self,
        low: &Key,
        high: &Key,
        ctx: &mut CoroContext<'_, Self::Endpoint>,
    ) -> BTreeMap<Key, Value>;

    /// Levels from root to leaf.
    fn height(&self) -> u32 {
        1
    }
}

/// Dispatch one request to the tree.
pub async fn execute<T: TreeIndex>(
    tree: &T,
    request: &Request,
    ctx: &mut CoroContext<'_, T::Endpoint>,
) {
    match request {
        Request::Search { key } => {
            tree.search(key, ctx).await;
        }
        Request::Insert { key, value } | Request::Update { key, value } => {
            tree.insert(key, *value, ctx).await;
        }
        Request::Scan { key, range_size } => {
            if let Some(high) = key.offset(*range_size) {
                tree.range_query(key, &high, ctx).await;
            }
        }
    }
}
