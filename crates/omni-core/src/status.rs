//! # Canonical Order Status
//!
//! The unified order lifecycle, independent of channel-native vocabulary,
//! plus the per-channel lookup tables that translate native status strings
//! into it.
//!
//! ## Lifecycle Graph
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Canonical Order Lifecycle                            │
//! │                                                                         │
//! │  Pending ──► Confirmed ──► Processing ──► Shipped ──► Delivered         │
//! │     │            │             │             │                          │
//! │     │            │             │             ├────────► Cancelled       │
//! │     └────────────┴─────────────┴─────────────┘                          │
//! │                                              └────────► Refunded        │
//! │                                                                         │
//! │  Any other edge is ANOMALOUS: recorded in the timeline with a flag,     │
//! │  never silently dropped, never silently reverted.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Unknown Native Statuses
//! Channels grow new vocabulary without warning. An unrecognized native
//! string maps to [`ChannelStatus::Unmapped`] and the order is flagged for
//! manual review rather than masked behind a guessed canonical state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Canonical Status
// =============================================================================

/// Unified order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    /// Order placed on the channel, not yet confirmed.
    Pending,
    /// Payment confirmed. First entry into this state decrements inventory.
    Confirmed,
    /// Being picked/packed.
    Processing,
    /// Handed to the carrier.
    Shipped,
    /// Delivered to the buyer. Terminal.
    Delivered,
    /// Cancelled before delivery. Terminal.
    Cancelled,
    /// Refunded after the fact. Terminal.
    Refunded,
}

impl CanonicalStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CanonicalStatus::Pending),
            "confirmed" => Some(CanonicalStatus::Confirmed),
            "processing" => Some(CanonicalStatus::Processing),
            "shipped" => Some(CanonicalStatus::Shipped),
            "delivered" => Some(CanonicalStatus::Delivered),
            "cancelled" => Some(CanonicalStatus::Cancelled),
            "refunded" => Some(CanonicalStatus::Refunded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Pending => "pending",
            CanonicalStatus::Confirmed => "confirmed",
            CanonicalStatus::Processing => "processing",
            CanonicalStatus::Shipped => "shipped",
            CanonicalStatus::Delivered => "delivered",
            CanonicalStatus::Cancelled => "cancelled",
            CanonicalStatus::Refunded => "refunded",
        }
    }

    /// Position along the forward path. Used to detect reversions.
    fn rank(&self) -> u8 {
        match self {
            CanonicalStatus::Pending => 0,
            CanonicalStatus::Confirmed => 1,
            CanonicalStatus::Processing => 2,
            CanonicalStatus::Shipped => 3,
            CanonicalStatus::Delivered | CanonicalStatus::Cancelled | CanonicalStatus::Refunded => 4,
        }
    }

    /// Whether this state sits on the linear fulfilment path
    /// (Pending through Delivered).
    fn on_fulfilment_path(&self) -> bool {
        !matches!(self, CanonicalStatus::Cancelled | CanonicalStatus::Refunded)
    }

    /// Terminal states have no outgoing canonical edges.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CanonicalStatus::Delivered | CanonicalStatus::Cancelled | CanonicalStatus::Refunded
        )
    }

    /// Whether `next` is directly reachable from `self` on the graph.
    ///
    /// Cancellation is reachable from any non-terminal state (buyers cancel
    /// at any point before delivery); Refunded is reachable from Shipped and
    /// Delivered.
    pub fn can_advance_to(&self, next: CanonicalStatus) -> bool {
        use CanonicalStatus::*;
        match (self, next) {
            (Pending, Confirmed)
            | (Confirmed, Processing)
            | (Processing, Shipped)
            | (Shipped, Delivered)
            | (Shipped, Refunded)
            | (Delivered, Refunded) => true,
            (from, Cancelled) if !from.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Transition Classification
// =============================================================================

/// How a proposed status change relates to the canonical graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionClass {
    /// The change is a no-op (same status).
    Unchanged,
    /// On the graph: normal forward progress.
    Forward,
    /// Off the graph (skip, reversion, edge from a terminal state). The
    /// status is still applied, but the timeline entry carries a flag.
    Anomalous,
}

/// Classifies a proposed transition.
///
/// Skipping forward along the fulfilment path (e.g., Pending → Shipped when
/// intermediate pulls were missed) is common channel behavior and counts as
/// Forward. The skip allowance never reaches Cancelled or Refunded: those
/// are only Forward over their explicit graph edges, so a refund reported
/// for an order that never shipped is flagged.
pub fn classify_transition(from: CanonicalStatus, to: CanonicalStatus) -> TransitionClass {
    if from == to {
        TransitionClass::Unchanged
    } else if from.can_advance_to(to) {
        TransitionClass::Forward
    } else if from.on_fulfilment_path() && to.on_fulfilment_path() && to.rank() > from.rank() {
        // Missed intermediate pulls: forward skip along the fulfilment path.
        TransitionClass::Forward
    } else {
        TransitionClass::Anomalous
    }
}

// =============================================================================
// Channel Status
// =============================================================================

/// Result of resolving a channel-native status string.
///
/// The explicit `Unmapped` case exists so new channel vocabulary surfaces
/// as "needs review" instead of being guessed into a canonical state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ChannelStatus {
    /// Mapped to a canonical state.
    Known(CanonicalStatus),
    /// Not in this channel's lookup table; raw string preserved for audit.
    Unmapped(String),
}

// =============================================================================
// Status Map
// =============================================================================

/// Per-channel lookup table from native status strings to canonical states.
///
/// Lookups are case-insensitive; channels are inconsistent about casing.
#[derive(Debug, Clone, Default)]
pub struct StatusMap {
    entries: HashMap<String, CanonicalStatus>,
}

impl StatusMap {
    /// Builds a map from (native, canonical) pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, CanonicalStatus)>,
        S: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(native, canonical)| (native.into().to_ascii_lowercase(), canonical))
            .collect();
        StatusMap { entries }
    }

    /// Resolves a native status string.
    pub fn resolve(&self, native: &str) -> ChannelStatus {
        match self.entries.get(&native.to_ascii_lowercase()) {
            Some(&canonical) => ChannelStatus::Known(canonical),
            None => ChannelStatus::Unmapped(native.to_string()),
        }
    }

    /// Lookup table for the in-memory simulator channel, which speaks a
    /// typical marketplace vocabulary.
    pub fn simulator() -> Self {
        use CanonicalStatus::*;
        StatusMap::from_pairs([
            ("awaiting_payment", Pending),
            ("payment_received", Confirmed),
            ("paid", Confirmed),
            ("in_fulfilment", Processing),
            ("dispatched", Shipped),
            ("completed", Delivered),
            ("buyer_cancelled", Cancelled),
            ("seller_cancelled", Cancelled),
            ("money_returned", Refunded),
        ])
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_edges() {
        use CanonicalStatus::*;
        assert_eq!(classify_transition(Pending, Confirmed), TransitionClass::Forward);
        assert_eq!(classify_transition(Confirmed, Processing), TransitionClass::Forward);
        assert_eq!(classify_transition(Shipped, Delivered), TransitionClass::Forward);
        assert_eq!(classify_transition(Processing, Cancelled), TransitionClass::Forward);
    }

    #[test]
    fn test_forward_skip_is_forward() {
        // Missed intermediate pulls still count as forward progress.
        assert_eq!(
            classify_transition(CanonicalStatus::Pending, CanonicalStatus::Shipped),
            TransitionClass::Forward
        );
    }

    #[test]
    fn test_refund_without_shipment_is_anomalous() {
        use CanonicalStatus::*;
        // Refunded is only reachable from Shipped or Delivered; a refund
        // reported earlier in the lifecycle is off the graph, not a skip.
        assert_eq!(classify_transition(Pending, Refunded), TransitionClass::Anomalous);
        assert_eq!(classify_transition(Confirmed, Refunded), TransitionClass::Anomalous);
        assert_eq!(classify_transition(Processing, Refunded), TransitionClass::Anomalous);
        assert_eq!(classify_transition(Shipped, Refunded), TransitionClass::Forward);
    }

    #[test]
    fn test_reversion_is_anomalous() {
        assert_eq!(
            classify_transition(CanonicalStatus::Shipped, CanonicalStatus::Pending),
            TransitionClass::Anomalous
        );
        assert_eq!(
            classify_transition(CanonicalStatus::Delivered, CanonicalStatus::Processing),
            TransitionClass::Anomalous
        );
    }

    #[test]
    fn test_terminal_edges() {
        // Cancelled orders do not come back.
        assert_eq!(
            classify_transition(CanonicalStatus::Cancelled, CanonicalStatus::Confirmed),
            TransitionClass::Anomalous
        );
        // Delivered can still be refunded.
        assert_eq!(
            classify_transition(CanonicalStatus::Delivered, CanonicalStatus::Refunded),
            TransitionClass::Forward
        );
    }

    #[test]
    fn test_same_status_unchanged() {
        assert_eq!(
            classify_transition(CanonicalStatus::Pending, CanonicalStatus::Pending),
            TransitionClass::Unchanged
        );
    }

    #[test]
    fn test_status_map_resolution() {
        let map = StatusMap::simulator();
        assert_eq!(
            map.resolve("paid"),
            ChannelStatus::Known(CanonicalStatus::Confirmed)
        );
        assert_eq!(
            map.resolve("DISPATCHED"),
            ChannelStatus::Known(CanonicalStatus::Shipped)
        );
        assert_eq!(
            map.resolve("mystery_state"),
            ChannelStatus::Unmapped("mystery_state".to_string())
        );
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            CanonicalStatus::Pending,
            CanonicalStatus::Confirmed,
            CanonicalStatus::Processing,
            CanonicalStatus::Shipped,
            CanonicalStatus::Delivered,
            CanonicalStatus::Cancelled,
            CanonicalStatus::Refunded,
        ] {
            assert_eq!(CanonicalStatus::parse(status.as_str()), Some(status));
        }
    }
}
