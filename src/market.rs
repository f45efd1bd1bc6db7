//! # Resource Market
//!
//! Matches task-group bids against agent offers.
//!
//! Bidders never touch the bid book directly. [`Market::bid`] sends a bid with
//! a `oneshot` response channel over an `mpsc` channel, and
//! [`Market::fetcher_loop`] is the single owner of the book: on every poll tick
//! it drains new bids, drops bids whose requester went away, fetches offers
//! from the [`OfferSource`] and answers the winners.
//!
//! Matching order:
//! 1. Higher bid amount first, FIFO among equal amounts
//! 2. Offer must have enough free memory and, when both sides name one, the same module
//! 3. Same rack beats same datacenter beats anything else
//! 4. Each offer is consumed at most once per round

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::operations;
use crate::logging::log_task_group_operation;
use crate::plan::TaskGroupId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarketError {
    #[error("Bid cancelled before an allocation was made")]
    Cancelled,

    #[error("Market loop is not running")]
    Closed,

    #[error("Failed to fetch offers: {0}")]
    OfferFetch(String),
}

/// Where an agent lives in the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentLocation {
    pub data_center: String,
    pub rack: String,
    /// Agent address (`host:port`)
    pub server: String,
}

impl AgentLocation {
    pub fn new(
        data_center: impl Into<String>,
        rack: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            data_center: data_center.into(),
            rack: rack.into(),
            server: server.into(),
        }
    }
}

impl fmt::Display for AgentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.server)
    }
}

/// Free capacity advertised by one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub location: AgentLocation,
    pub memory_mb: u64,
    #[serde(default)]
    pub module: String,
}

/// Cluster targeting attached to every bid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub data_center: String,
    pub rack: String,
    pub module: String,
    pub memory_mb: u64,
}

/// Outstanding demand as shared with the offer source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidSummary {
    pub task_group_id: TaskGroupId,
    pub amount: f64,
    pub requirement: ResourceRequirement,
}

/// Capacity granted to one bidder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub task_group_id: TaskGroupId,
    pub location: AgentLocation,
    pub memory_mb: u64,
    pub amount: f64,
}

/// Supplies agent offers for each matching round
#[async_trait]
pub trait OfferSource: Send + Sync {
    async fn fetch_offers(&self, demand: &[BidSummary]) -> Result<Vec<Offer>, MarketError>;
}

#[derive(Debug)]
struct Bid {
    summary: BidSummary,
    responder: oneshot::Sender<Allocation>,
}

#[derive(Debug, Default)]
struct MarketStats {
    bids_submitted: AtomicU64,
    bids_matched: AtomicU64,
    rounds: AtomicU64,
    fetch_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStatsSnapshot {
    pub bids_submitted: u64,
    pub bids_matched: u64,
    pub rounds: u64,
    pub fetch_failures: u64,
}

pub struct Market {
    bid_tx: mpsc::UnboundedSender<Bid>,
    bid_rx: Mutex<Option<mpsc::UnboundedReceiver<Bid>>>,
    source: Arc<dyn OfferSource>,
    poll_interval: Duration,
    stats: MarketStats,
}

impl fmt::Debug for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Market")
            .field("poll_interval", &self.poll_interval)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Market {
    pub fn new(source: Arc<dyn OfferSource>, poll_interval: Duration) -> Self {
        let (bid_tx, bid_rx) = mpsc::unbounded_channel();
        Self {
            bid_tx,
            bid_rx: Mutex::new(Some(bid_rx)),
            source,
            poll_interval,
            stats: MarketStats::default(),
        }
    }

    /// Submit a bid and wait for an allocation or cancellation
    pub async fn bid(
        &self,
        token: &CancellationToken,
        task_group_id: TaskGroupId,
        amount: f64,
        requirement: ResourceRequirement,
    ) -> Result<Allocation, MarketError> {
        if token.is_cancelled() {
            return Err(MarketError::Cancelled);
        }

        let (responder, allocation) = oneshot::channel();
        let bid = Bid {
            summary: BidSummary {
                task_group_id,
                amount,
                requirement,
            },
            responder,
        };
        self.bid_tx.send(bid).map_err(|_| MarketError::Closed)?;
        self.stats.bids_submitted.fetch_add(1, Ordering::Relaxed);

        let amount_text = format!("{amount}");
        log_task_group_operation(
            operations::BID_SUBMITTED,
            task_group_id,
            None,
            "waiting",
            Some(&amount_text),
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(MarketError::Cancelled),
            allocation = allocation => allocation.map_err(|_| MarketError::Closed),
        }
    }

    /// Matching loop. Runs until `token` is cancelled; may be started only once.
    pub async fn fetcher_loop(&self, token: CancellationToken) {
        let Some(mut bids) = self.bid_rx.lock().take() else {
            error!("💰 MARKET: Fetcher loop already started, refusing to run twice");
            return;
        };

        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "💰 MARKET: Fetcher loop started"
        );

        let mut book: Vec<Bid> = Vec::new();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(bid) = bids.recv() => book.push(bid),
                _ = ticker.tick() => {
                    while let Ok(bid) = bids.try_recv() {
                        book.push(bid);
                    }
                    self.match_round(&token, &mut book).await;
                }
            }
        }

        info!(
            outstanding = book.len(),
            matched = self.stats.bids_matched.load(Ordering::Relaxed),
            "💰 MARKET: Fetcher loop stopped"
        );
    }

    async fn match_round(&self, token: &CancellationToken, book: &mut Vec<Bid>) {
        book.retain(|bid| !bid.responder.is_closed());
        if book.is_empty() {
            return;
        }
        self.stats.rounds.fetch_add(1, Ordering::Relaxed);

        let demand: Vec<BidSummary> = book.iter().map(|bid| bid.summary.clone()).collect();
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            fetched = self.source.fetch_offers(&demand) => fetched,
        };

        let offers = match fetched {
            Ok(offers) => offers,
            Err(e) => {
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %e,
                    outstanding = book.len(),
                    "💰 MARKET: Offer fetch failed, retrying next round"
                );
                return;
            }
        };

        let matches = match_offers(&demand, &offers);
        debug!(
            bids = demand.len(),
            offers = offers.len(),
            matched = matches.len(),
            "💰 MARKET: Matching round complete"
        );
        if matches.is_empty() {
            return;
        }

        let mut winners: Vec<Option<usize>> = vec![None; book.len()];
        for (bid_index, offer_index) in matches {
            winners[bid_index] = Some(offer_index);
        }

        let mut remaining = Vec::with_capacity(book.len());
        for (bid, winner) in book.drain(..).zip(winners) {
            let Some(offer_index) = winner else {
                remaining.push(bid);
                continue;
            };
            let offer = &offers[offer_index];
            let allocation = Allocation {
                task_group_id: bid.summary.task_group_id,
                location: offer.location.clone(),
                memory_mb: bid.summary.requirement.memory_mb,
                amount: bid.summary.amount,
            };

            if bid.responder.send(allocation).is_ok() {
                self.stats.bids_matched.fetch_add(1, Ordering::Relaxed);
                log_task_group_operation(
                    operations::BID_MATCHED,
                    bid.summary.task_group_id,
                    Some(&offer.location.server),
                    "allocated",
                    None,
                );
            } else {
                debug!(
                    task_group_id = bid.summary.task_group_id,
                    "💰 MARKET: Bidder left before allocation was delivered"
                );
            }
        }
        *book = remaining;
    }

    pub fn stats(&self) -> MarketStatsSnapshot {
        MarketStatsSnapshot {
            bids_submitted: self.stats.bids_submitted.load(Ordering::Relaxed),
            bids_matched: self.stats.bids_matched.load(Ordering::Relaxed),
            rounds: self.stats.rounds.load(Ordering::Relaxed),
            fetch_failures: self.stats.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Locality score of an offer for a requirement, `None` if it does not qualify
pub fn locality_score(requirement: &ResourceRequirement, offer: &Offer) -> Option<u8> {
    if offer.memory_mb < requirement.memory_mb {
        return None;
    }
    if !requirement.module.is_empty()
        && !offer.module.is_empty()
        && requirement.module != offer.module
    {
        return None;
    }

    let same_dc = !requirement.data_center.is_empty()
        && requirement.data_center == offer.location.data_center;
    let same_rack =
        same_dc && !requirement.rack.is_empty() && requirement.rack == offer.location.rack;

    Some(match (same_dc, same_rack) {
        (_, true) => 2,
        (true, false) => 1,
        _ => 0,
    })
}

/// Pair bids with offers. Returns `(bid index, offer index)` pairs.
pub fn match_offers(bids: &[BidSummary], offers: &[Offer]) -> Vec<(usize, usize)> {
    let mut order: Vec<usize> = (0..bids.len()).collect();
    // Stable sort keeps submission order among equal amounts
    order.sort_by(|&a, &b| bids[b].amount.total_cmp(&bids[a].amount));

    let mut consumed = vec![false; offers.len()];
    let mut matches = Vec::new();

    for bid_index in order {
        let requirement = &bids[bid_index].requirement;
        let best = offers
            .iter()
            .enumerate()
            .filter(|(offer_index, _)| !consumed[*offer_index])
            .filter_map(|(offer_index, offer)| {
                locality_score(requirement, offer).map(|score| (score, offer_index))
            })
            // Highest score, earliest offer on ties
            .max_by(|(score_a, index_a), (score_b, index_b)| {
                score_a.cmp(score_b).then(index_b.cmp(index_a))
            });

        if let Some((_, offer_index)) = best {
            consumed[offer_index] = true;
            matches.push((bid_index, offer_index));
        }
    }
    matches
}
