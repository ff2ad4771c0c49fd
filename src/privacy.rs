//! Privacy classification for health and fitness events.

use crate::event::{
    Event, Tag, EXERCISE_TEMPLATE_KIND, HEALTH_KIND_MAX, HEALTH_KIND_MIN, WORKOUT_RECORD_KIND,
    WORKOUT_TEMPLATE_KIND,
};

/// Where an accepted event is allowed to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyLevel {
    /// Stored on the main relay, visible to everyone.
    Public,
    /// Stored on the main relay with restricted distribution.
    Limited,
    /// Offloaded to a satellite node; only a reference stays local.
    Private,
}

/// Classify an event. Deterministic and stateless: the same event always
/// classifies the same way.
///
/// An explicit `privacy` tag (or the legacy `privacy_level` alias) with a
/// recognized value wins; the first recognized tag in event order settles
/// conflicts. Otherwise the kind decides.
pub fn classify(ev: &Event) -> PrivacyLevel {
    for Tag(fields) in &ev.tags {
        if fields.len() >= 2 && (fields[0] == "privacy" || fields[0] == "privacy_level") {
            match fields[1].as_str() {
                "public" => return PrivacyLevel::Public,
                "limited" | "friends" => return PrivacyLevel::Limited,
                "private" => return PrivacyLevel::Private,
                _ => {}
            }
        }
    }
    match ev.kind {
        WORKOUT_RECORD_KIND => PrivacyLevel::Limited,
        EXERCISE_TEMPLATE_KIND | WORKOUT_TEMPLATE_KIND => PrivacyLevel::Public,
        // Achievements and challenges are shareable by default.
        k if (32040..=HEALTH_KIND_MAX).contains(&k) => PrivacyLevel::Public,
        // Shared metrics.
        k if (32030..=32039).contains(&k) => PrivacyLevel::Limited,
        // Personal metrics.
        k if (HEALTH_KIND_MIN..=32029).contains(&k) => PrivacyLevel::Private,
        _ => PrivacyLevel::Public,
    }
}
