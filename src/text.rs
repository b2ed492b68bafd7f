//! Boundary text relay: routes subtitle/caption spans to reels and carries
//! "hanging" fragments across reel boundaries.
//!
//! A span whose end falls in a later reel is truncated in its current reel
//! (backed off two frame-intervals before the boundary, so the target format's
//! "too close together" validation never trips) and the remainder is held as
//! a pending fragment per overlapped reel until that reel opens.

use std::collections::HashMap;

use log::{debug, trace};

use crate::error::{Result, WriterError};
use crate::time::{DcpTime, DcpTimePeriod};
use crate::types::{Font, FontSet, TextSpan, TextType};

/// Frame-intervals backed off from a reel boundary when truncating.
const BOUNDARY_BACKOFF_FRAMES: i64 = 2;

type TrackKey = (TextType, Option<String>);

/// Delivery callback: `(reel, span, type, track, period, fonts, fallback)`.
pub type TextDeliver<'a> = &'a mut dyn FnMut(
    usize,
    &TextSpan,
    TextType,
    Option<&str>,
    DcpTimePeriod,
    &FontSet,
    Option<&Font>,
) -> Result<()>;

#[derive(Debug)]
struct PendingText {
    span: TextSpan,
    kind: TextType,
    track: Option<String>,
    target_reel: usize,
    period: DcpTimePeriod,
}

#[derive(Debug)]
pub struct TextRouter {
    periods: Vec<DcpTimePeriod>,
    frame_rate: u32,
    /// Single-font-declaration target: fonts coalesce to one id on delivery.
    interop: bool,
    cursors: HashMap<TrackKey, usize>,
    pending: Vec<PendingText>,
    fonts: FontSet,
}

impl TextRouter {
    pub fn new(periods: Vec<DcpTimePeriod>, frame_rate: u32, interop: bool) -> Self {
        TextRouter {
            periods,
            frame_rate,
            interop,
            cursors: HashMap::new(),
            pending: Vec::new(),
            fonts: FontSet::new(),
        }
    }

    fn backoff(&self) -> DcpTime {
        DcpTime(DcpTime::frame_interval(self.frame_rate).ticks() * BOUNDARY_BACKOFF_FRAMES)
    }

    /// Fonts delivered alongside every text write, coalesced for interop.
    fn delivery_fonts(&self) -> FontSet {
        if self.interop { self.fonts.coalesced() } else { self.fonts.clone() }
    }

    /// Record fonts to embed, deduplicated by id.
    pub fn add_fonts(&mut self, fonts: Vec<Font>) {
        for font in fonts {
            let id = font.id.clone();
            if !self.fonts.insert(font) {
                trace!("duplicate font id {:?} ignored", id);
            }
        }
        if self.interop && self.fonts.len() > 1 {
            debug!(
                "target format allows a single embedded font; {} fonts will share one id",
                self.fonts.len()
            );
        }
    }

    pub fn fonts(&self) -> &FontSet {
        &self.fonts
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Route one span. The per-track cursor advances monotonically; pending
    /// fragments for a reel are flushed when that track's cursor reaches it.
    pub fn route(
        &mut self,
        span: TextSpan,
        kind: TextType,
        track: Option<String>,
        period: DcpTimePeriod,
        deliver: TextDeliver<'_>,
    ) -> Result<()> {
        let key: TrackKey = (kind, track.clone());
        let mut reel = *self.cursors.get(&key).unwrap_or(&0);

        // Open later reels as the track's time moves into them.
        while reel < self.periods.len() && period.from >= self.periods[reel].to {
            reel += 1;
            self.flush_reel_for_key(reel, &key, deliver)?;
        }
        self.cursors.insert(key, reel);

        let Some(&current) = self.periods.get(reel) else {
            return Err(WriterError::ContractViolation(format!(
                "text span starting at {} falls beyond the last reel",
                period.from
            )));
        };
        if period.from < current.from {
            return Err(WriterError::ContractViolation(format!(
                "text span at {} arrived out of time order for its track",
                period.from
            )));
        }

        if period.to <= current.to {
            let fonts = self.delivery_fonts();
            return deliver(reel, &span, kind, track.as_deref(), period, &fonts, fonts.first());
        }

        // Overruns the current reel: truncate with back-off, defer the rest.
        let truncated = DcpTimePeriod::new(period.from, (current.to - self.backoff()).max(period.from));
        debug!(
            "text span {} crosses reel {} boundary; truncated to {} with remainder deferred",
            period, reel, truncated
        );
        {
            let fonts = self.delivery_fonts();
            deliver(reel, &span, kind, track.as_deref(), truncated, &fonts, fonts.first())?;
        }

        for later in reel + 1..self.periods.len() {
            let Some(overlap) = self.periods[later].overlap(&period) else {
                break;
            };
            // A fragment that still overruns its reel gets the same back-off.
            let to = if period.to > self.periods[later].to {
                (self.periods[later].to - self.backoff()).max(overlap.from)
            } else {
                overlap.to
            };
            let fragment = DcpTimePeriod::new(overlap.from, to);
            trace!("hanging text fragment for reel {}: {}", later, fragment);
            self.pending.push(PendingText {
                span: span.clone(),
                kind,
                track: track.clone(),
                target_reel: later,
                period: fragment,
            });
        }
        Ok(())
    }

    /// Flush pending fragments for `reel` belonging to `key`.
    fn flush_reel_for_key(&mut self, reel: usize, key: &TrackKey, deliver: TextDeliver<'_>) -> Result<()> {
        let fonts = self.delivery_fonts();
        let mut i = 0;
        while i < self.pending.len() {
            let matches = {
                let p = &self.pending[i];
                p.target_reel == reel && p.kind == key.0 && p.track == key.1
            };
            if matches {
                let p = self.pending.remove(i);
                debug!("flushing hanging text into reel {}: {}", p.target_reel, p.period);
                deliver(p.target_reel, &p.span, p.kind, p.track.as_deref(), p.period, &fonts, fonts.first())?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Flush every remaining fragment, in reel order. Called at finish, once
    /// all reels are known to be open.
    pub fn flush_all(&mut self, deliver: TextDeliver<'_>) -> Result<()> {
        let fonts = self.delivery_fonts();
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|p| (p.target_reel, p.period.from));
        for p in pending {
            debug!("flushing hanging text into reel {}: {}", p.target_reel, p.period);
            deliver(p.target_reel, &p.span, p.kind, p.track.as_deref(), p.period, &fonts, fonts.first())?;
        }
        Ok(())
    }
}
