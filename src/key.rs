//! Channel identity types.
//!
//! A [`ChannelKey`] identifies one plotted series: the archived channel name,
//! the curve slot it occupies, the owning widget and the axis role it plays.
//! Several channel keys that differ only by curve slot and axis role share a
//! single fetch; that shared identity is the [`RetrievalKey`], obtained as a
//! pure projection of the channel key.

use std::fmt;

/// Which series of a channel a key represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisRole {
    /// The primary value (mean, for binned data).
    Primary,
    /// Lower band of a binned min/max envelope.
    MinBand,
    /// Upper band of a binned min/max envelope.
    MaxBand,
}

/// Opaque identity of the widget that owns a curve.
///
/// Different widgets may plot the same channel with different window lengths,
/// so the widget identity is part of the retrieval identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetId(String);

impl WidgetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one logical data stream as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    /// Archived channel (PV) name.
    pub channel: String,
    /// Curve slot within the owning widget.
    pub curve_slot: u8,
    /// Owning widget.
    pub widget: WidgetId,
    /// Axis role of this key.
    pub axis: AxisRole,
}

impl ChannelKey {
    pub fn new(
        channel: impl Into<String>,
        curve_slot: u8,
        widget: WidgetId,
        axis: AxisRole,
    ) -> Self {
        Self {
            channel: channel.into(),
            curve_slot,
            widget,
            axis,
        }
    }

    /// Project this key onto its retrieval identity, dropping curve slot and
    /// axis role.
    pub fn retrieval_key(&self) -> RetrievalKey {
        RetrievalKey {
            channel: self.channel.clone(),
            widget: self.widget.clone(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}@{}[{:?}]",
            self.curve_slot, self.channel, self.widget, self.axis
        )
    }
}

/// Normalized identity grouping channel-key variants that share one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RetrievalKey {
    pub channel: String,
    pub widget: WidgetId,
}

impl RetrievalKey {
    pub fn new(channel: impl Into<String>, widget: WidgetId) -> Self {
        Self {
            channel: channel.into(),
            widget,
        }
    }
}

impl fmt::Display for RetrievalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.channel, self.widget)
    }
}
