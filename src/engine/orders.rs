//! Bulk order ingestion: one task per region, joined by the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Scanner;
use crate::esi::market::{HistoryBucket, MarketOrder, OrderSide};
use crate::esi::Deadline;

/// Workers used for per-type history enrichment.
const HISTORY_WORKERS: usize = 30;

/// Pulls every region's book in parallel and keeps only orders located in
/// `allowed_systems` (when given). Failed regions are skipped and reported
/// back so the scan can carry a progress warning instead of dying.
pub async fn fetch_orders(
    scanner: &Scanner,
    regions: &HashSet<i32>,
    side: OrderSide,
    allowed_systems: Option<&HashMap<i32, u32>>,
    cancel: &CancellationToken,
    deadline: Deadline,
) -> (Vec<MarketOrder>, Vec<i32>) {
    let allowed: Option<HashSet<i32>> = allowed_systems.map(|m| m.keys().copied().collect());

    let mut handles = Vec::with_capacity(regions.len());
    for &region_id in regions {
        let esi = scanner.esi.clone();
        let cancel = cancel.clone();
        let allowed = allowed.clone();
        handles.push(tokio::spawn(async move {
            match esi
                .fetch_region_orders(region_id, side, &cancel, deadline)
                .await
            {
                Ok(mut orders) => {
                    if let Some(allowed) = &allowed {
                        orders.retain(|o| allowed.contains(&o.system_id));
                    }
                    debug!(region_id, count = orders.len(), "region orders fetched");
                    Ok(orders)
                }
                Err(e) => {
                    warn!(region_id, error = %e, "region order fetch failed, skipping");
                    Err(region_id)
                }
            }
        }));
    }

    let mut orders = Vec::new();
    let mut failed = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(batch)) => orders.extend(batch),
            Ok(Err(region_id)) => failed.push(region_id),
            Err(e) => warn!(error = %e, "region fetch task panicked"),
        }
    }
    (orders, failed)
}

/// Buckets orders by type id, preserving arrival order within a bucket.
pub fn bucket_by_type(orders: Vec<MarketOrder>) -> HashMap<i32, Vec<MarketOrder>> {
    let mut buckets: HashMap<i32, Vec<MarketOrder>> = HashMap::new();
    for order in orders {
        buckets.entry(order.type_id).or_default().push(order);
    }
    buckets
}

/// Location-to-system mapping observed in market data. This covers player
/// structures the static catalog cannot resolve.
pub fn location_systems(orders: &[MarketOrder]) -> HashMap<i64, i32> {
    let mut map = HashMap::new();
    for order in orders {
        if order.location_id != 0 && order.system_id != 0 {
            map.entry(order.location_id).or_insert(order.system_id);
        }
    }
    map
}

/// Fetches history for many types through the shared cache with a bounded
/// worker pool. Types whose fetch fails are simply absent from the result.
pub async fn enrich_histories(
    scanner: &Scanner,
    region_id: i32,
    type_ids: &HashSet<i32>,
    cancel: &CancellationToken,
    deadline: Deadline,
) -> HashMap<i32, Arc<Vec<HistoryBucket>>> {
    let semaphore = Arc::new(Semaphore::new(HISTORY_WORKERS));
    let futures: Vec<_> = type_ids
        .iter()
        .map(|&type_id| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let esi = scanner.esi.clone();
                let result = scanner
                    .caches
                    .history
                    .get_or_fetch((region_id, type_id), || async move {
                        let entries = esi
                            .fetch_market_history(region_id, type_id, cancel, deadline)
                            .await?;
                        Ok(Arc::new(entries))
                    })
                    .await;
                match result {
                    Ok(entries) => Some((type_id, entries)),
                    Err(e) => {
                        debug!(type_id, region_id, error = %e, "history fetch failed");
                        None
                    }
                }
            }
        })
        .collect();

    futures_util::future::join_all(futures)
        .await
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(type_id: i32, location_id: i64, system_id: i32) -> MarketOrder {
        MarketOrder {
            order_id: 0,
            type_id,
            location_id,
            system_id,
            is_buy: false,
            price: 10.0,
            volume_remaining: 1,
            volume_total: 1,
            min_volume: 1,
            range: String::new(),
            issued_at: String::new(),
        }
    }

    #[test]
    fn bucketing_groups_by_type() {
        let buckets = bucket_by_type(vec![order(34, 1, 1), order(35, 1, 1), order(34, 2, 1)]);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[&34].len(), 2);
        assert_eq!(buckets[&35].len(), 1);
    }

    #[test]
    fn location_map_keeps_first_seen_and_skips_zeroes() {
        let orders = vec![order(34, 100, 1), order(34, 100, 2), order(34, 0, 3)];
        let map = location_systems(&orders);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&100], 1);
    }
}
