//! Release selection.
//!
//! Every parsed item is scored for the running platform. A score of zero
//! rejects the item; otherwise the highest score wins and ties keep the
//! item that came first in the feed. Scoring is a pure function, the
//! parsed items are never mutated.
//!
//! Score layout (`u32`):
//!
//! ```text
//!  31 30 | 29 ............ 16 | 15 ............. 0
//!  os    | min OS major       | min OS minor
//! ```
//!
//! where `os` is 1 for a generic OS label and 2 for an exact
//! architecture match.

use tracing::{debug, trace};

use crate::error::ParseError;
use crate::manifest::{parse_items, ManifestItem};
use crate::platform::{OsContext, OsVersion};

const OS_GENERIC: u32 = 1;
const OS_ARCH_EXACT: u32 = 2;

/// How specifically an item targets the running OS, or `None` if it does
/// not run here at all.
fn os_specificity(item: &ManifestItem, ctx: &OsContext) -> Option<u32> {
    if ctx.os_label.is_empty() {
        return Some(OS_GENERIC);
    }
    match item.os_label.as_deref().map(str::trim) {
        None | Some("") => Some(OS_GENERIC),
        Some(label) if label == ctx.os_label => Some(OS_GENERIC),
        Some(label) if label == ctx.arch_label() => Some(OS_ARCH_EXACT),
        Some(_) => None,
    }
}

/// Score an item for `ctx`. Zero means "not suitable".
pub fn weigh(item: &ManifestItem, ctx: &OsContext) -> u32 {
    let Some(os_score) = os_specificity(item, ctx) else {
        trace!(title = %item.title, os = ?item.os_label, "Rejected: OS label");
        return 0;
    };

    let minimum = match item.minimum_system_version.as_deref() {
        None => OsVersion::default(),
        Some(required) => {
            let Some(minimum) = OsVersion::parse(required) else {
                trace!(title = %item.title, required, "Rejected: unreadable minimum OS version");
                return 0;
            };
            if let Some(running) = ctx.os_version {
                if running.compare(&minimum).is_lt() {
                    trace!(title = %item.title, %running, %minimum, "Rejected: OS too old");
                    return 0;
                }
            }
            minimum
        }
    };

    (os_score << 30) | (minimum.major.min(0x3FFF) << 16) | minimum.minor.min(0xFFFF)
}

/// Pick the best item for `ctx` together with its score.
pub fn select<'a>(items: &'a [ManifestItem], ctx: &OsContext) -> Option<(&'a ManifestItem, u32)> {
    let mut best: Option<(&ManifestItem, u32)> = None;
    for item in items {
        let weight = weigh(item, ctx);
        if weight == 0 {
            continue;
        }
        if best.map_or(true, |(_, w)| weight > w) {
            best = Some((item, weight));
        }
    }
    best
}

/// Parse a feed and select the best release for `ctx`.
///
/// `Ok(None)` means the feed is valid but offers nothing for this platform.
pub fn parse_and_select_for(
    document: &str,
    required_channel: &str,
    ctx: &OsContext,
) -> Result<Option<ManifestItem>, ParseError> {
    let items = parse_items(document, required_channel)?;
    let selected = select(&items, ctx).map(|(item, weight)| {
        debug!(
            title = %item.title,
            version = %item.effective_version(),
            weight,
            "Selected release"
        );
        item.clone()
    });
    if selected.is_none() {
        debug!(candidates = items.len(), "No suitable release for this platform");
    }
    Ok(selected)
}

/// Parse a feed and select the best release for the running machine,
/// with `os_label` as the generic OS label (empty disables OS filtering).
pub fn parse_and_select(
    document: &str,
    required_channel: &str,
    os_label: &str,
) -> Result<Option<ManifestItem>, ParseError> {
    let mut ctx = OsContext::current();
    ctx.os_label = os_label.to_string();
    parse_and_select_for(document, required_channel, &ctx)
}
