//! Properties of scoring, thresholds and the safety rails

mod common;

use chrono::{Duration, Utc};
use common::create_test_message;
use inbox_triage::classifier::RuleClassifier;
use inbox_triage::config::{ClassificationThresholds, SafetyConfig};
use inbox_triage::models::{Disposition, ListHeaders, MessageCategory, MessageMetadata};
use inbox_triage::safety::{SafetyContext, SafetyRails};
use proptest::prelude::*;

fn rank(disposition: Disposition) -> u8 {
    match disposition {
        Disposition::Keep => 0,
        Disposition::Review => 1,
        Disposition::Archive => 2,
        Disposition::Trash => 3,
    }
}

fn thresholds_strategy() -> impl Strategy<Value = ClassificationThresholds> {
    (0.05f64..0.4, 0.05f64..0.3, 0.05f64..0.3).prop_map(|(review, archive_gap, trash_gap)| {
        ClassificationThresholds {
            review,
            archive: review + archive_gap,
            trash: review + archive_gap + trash_gap,
        }
    })
}

fn category_strategy() -> impl Strategy<Value = MessageCategory> {
    prop_oneof![
        Just(MessageCategory::Primary),
        Just(MessageCategory::Promotions),
        Just(MessageCategory::Social),
        Just(MessageCategory::Updates),
        Just(MessageCategory::Forums),
        Just(MessageCategory::Unknown),
    ]
}

prop_compose! {
    fn message_strategy()(
        category in category_strategy(),
        has_unsubscribe in any::<bool>(),
        is_bulk in any::<bool>(),
        is_auto_generated in any::<bool>(),
        important in any::<bool>(),
        subject in "[A-Za-z%:! ]{0,40}",
        local in prop_oneof![Just("noreply"), Just("news"), Just("alice")],
        domain in prop_oneof![Just("sendgrid.net"), Just("example.com"), Just("shop.co")],
        age_days in 0i64..60,
    ) -> MessageMetadata {
        let sender = format!("{}@{}", local, domain);
        let mut message = create_test_message("p1", &sender, &subject);
        message.category = category;
        message.headers = ListHeaders { has_unsubscribe, is_bulk, is_auto_generated };
        if important {
            message.labels.push("IMPORTANT".to_string());
        }
        message.date_received = Utc::now() - Duration::days(age_days);
        message
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn disposition_is_monotonic_in_score(
        thresholds in thresholds_strategy(),
        a in 0.0f64..=1.0,
        b in 0.0f64..=1.0,
    ) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let (low, high) = (thresholds.disposition_for(low), thresholds.disposition_for(high));
        prop_assert!(rank(low) <= rank(high));
    }

    #[test]
    fn threshold_lower_bounds_are_inclusive(thresholds in thresholds_strategy()) {
        prop_assert_eq!(thresholds.disposition_for(thresholds.trash), Disposition::Trash);
        prop_assert_eq!(thresholds.disposition_for(thresholds.archive), Disposition::Archive);
        prop_assert_eq!(thresholds.disposition_for(thresholds.review), Disposition::Review);
        prop_assert_eq!(thresholds.disposition_for(0.0), Disposition::Keep);
    }

    #[test]
    fn rule_confidence_stays_in_unit_range(message in message_strategy()) {
        let result = RuleClassifier::new(ClassificationThresholds::default()).evaluate(&message);
        prop_assert!((0.0..=1.0).contains(&result.confidence));
        prop_assert_eq!(
            result.disposition,
            ClassificationThresholds::default().disposition_for(result.confidence)
        );
    }

    #[test]
    fn starred_messages_are_always_kept(
        message in message_strategy(),
        is_contact in any::<bool>(),
    ) {
        let mut message = message;
        message.labels.push("STARRED".to_string());
        let rails = SafetyRails::new(&SafetyConfig::default());
        let ctx = SafetyContext { is_contact, open_rate: None };

        let scored = RuleClassifier::new(ClassificationThresholds::default()).evaluate(&message);
        let result = rails.post_check(&message, &ctx, scored, Utc::now());

        prop_assert_eq!(result.disposition, Disposition::Keep);
        prop_assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn contacts_are_never_archived_or_trashed(message in message_strategy()) {
        let rails = SafetyRails::new(&SafetyConfig::default());
        let ctx = SafetyContext { is_contact: true, open_rate: None };

        let scored = RuleClassifier::new(ClassificationThresholds::default()).evaluate(&message);
        let result = rails.post_check(&message, &ctx, scored, Utc::now());

        prop_assert_eq!(result.disposition, Disposition::Keep);
    }

    #[test]
    fn fresh_trash_needs_high_confidence(message in message_strategy()) {
        let mut message = message;
        message.date_received = Utc::now() - Duration::hours(12);
        let rails = SafetyRails::new(&SafetyConfig::default());
        let ctx = SafetyContext::default();

        let scored = RuleClassifier::new(ClassificationThresholds::default()).evaluate(&message);
        let result = rails.post_check(&message, &ctx, scored, Utc::now());

        if result.disposition == Disposition::Trash {
            prop_assert!(result.confidence >= 0.95);
        }
    }
}
