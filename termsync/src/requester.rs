//! History backfill windows.
//!
//! Every contact has a [`Requester`] remembering which time ranges have
//! already been requested from the network: the `oldest` range (how far
//! back history reaches) and the `newest` range (how recent it is). From
//! that it computes the next range to ask for:
//!
//! - catching up (`newest = true`) with a known newest range asks for
//!   everything since that range ended;
//! - otherwise, with a known oldest range, it steps one default window
//!   further into the past;
//! - with no history at all it asks for the default window ending now.
//!
//! [`batch`] merges per-contact requests with equal ranges so the network
//! sees as few round-trips as possible. Merging is by exact equality only.

use std::time::Duration;

use crate::transport::{ChatOptions, RequestOptions};

/// A closed range of unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// Start, inclusive.
    pub from: i64,
    /// End, inclusive.
    pub to: i64,
}

impl TimeRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }
}

/// Ranges already requested for one contact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestWindow {
    /// Range reaching furthest into the past.
    pub oldest: Option<TimeRange>,
    /// Range reaching closest to the present.
    pub newest: Option<TimeRange>,
}

impl RequestWindow {
    /// Widens the window with a range that was successfully requested.
    pub fn update(&mut self, range: TimeRange) {
        if self.oldest.is_none_or(|oldest| range.from < oldest.from) {
            self.oldest = Some(range);
        }
        if self.newest.is_none_or(|newest| range.to > newest.to) {
            self.newest = Some(range);
        }
    }
}

/// Computes backfill requests for one contact.
#[derive(Debug, Clone)]
pub struct Requester {
    chat: ChatOptions,
    window: RequestWindow,
    default_secs: i64,
    limit: u32,
}

impl Requester {
    /// Creates a requester with an empty window.
    #[must_use]
    pub fn new(chat: ChatOptions, default_window: Duration, limit: u32) -> Self {
        Self {
            chat,
            window: RequestWindow::default(),
            default_secs: i64::try_from(default_window.as_secs()).unwrap_or(i64::MAX),
            limit,
        }
    }

    /// The chat this requester asks about.
    #[must_use]
    pub const fn chat(&self) -> &ChatOptions {
        &self.chat
    }

    /// Current window.
    #[must_use]
    pub const fn window(&self) -> RequestWindow {
        self.window
    }

    /// Replaces the window, e.g. with one persisted across restarts.
    pub const fn restore(&mut self, window: RequestWindow) {
        self.window = window;
    }

    /// The default range ending at `now`.
    #[must_use]
    pub const fn default_range(&self, now: i64) -> TimeRange {
        TimeRange::new(now.saturating_sub(self.default_secs), now)
    }

    /// The next range to request.
    #[must_use]
    pub fn next_range(&self, newest: bool, now: i64) -> TimeRange {
        match (newest, self.window.newest, self.window.oldest) {
            (true, Some(latest), _) => TimeRange::new(latest.to.min(now), now),
            (_, _, Some(oldest)) => {
                TimeRange::new(oldest.from.saturating_sub(self.default_secs), oldest.to)
            }
            _ => self.default_range(now),
        }
    }

    /// Request options covering `range` for this contact alone.
    #[must_use]
    pub fn options(&self, range: TimeRange) -> RequestOptions {
        RequestOptions {
            chats: vec![self.chat.clone()],
            from: range.from,
            to: range.to,
            limit: self.limit,
        }
    }

    /// The next request for this contact alone.
    #[must_use]
    pub fn next_options(&self, newest: bool, now: i64) -> RequestOptions {
        self.options(self.next_range(newest, now))
    }

    /// Records a successful request.
    pub fn update(&mut self, options: &RequestOptions) {
        self.window.update(TimeRange::new(options.from, options.to));
    }
}

/// Merges per-contact requests whose range and limit are equal.
///
/// Returns one merged request per distinct `(from, to, limit)`, in
/// first-seen order, together with the keys it covers.
pub fn batch<K>(planned: Vec<(K, RequestOptions)>) -> Vec<(Vec<K>, RequestOptions)> {
    let mut batches: Vec<(Vec<K>, RequestOptions)> = Vec::new();
    for (key, options) in planned {
        let existing = batches.iter_mut().find(|(_, b)| {
            b.from == options.from && b.to == options.to && b.limit == options.limit
        });
        match existing {
            Some((keys, merged)) => {
                keys.push(key);
                for chat in options.chats {
                    if !merged.chats.contains(&chat) {
                        merged.chats.push(chat);
                    }
                }
            }
            None => batches.push((vec![key], options)),
        }
    }
    batches
}
