//! Cumulative exposure counts per day

use crate::exposure::ExposureDecisions;
use crate::types::{
    AnalysisWindow, Assignment, ExposureTimeseries, MultipleVariantHandling, MULTIPLE_VARIANT_KEY,
};
use std::collections::BTreeMap;

/// Build cumulative first-exposure counts for every day of `window`.
///
/// Each subject is counted once, on the day of its first exposure, in the
/// series of its variant. Excluded subjects go to the `$multiple` series,
/// which only exists under [`MultipleVariantHandling::Exclude`].
pub fn build_timeseries(
    decisions: &ExposureDecisions,
    variant_keys: &[String],
    policy: MultipleVariantHandling,
    window: &AnalysisWindow,
) -> ExposureTimeseries {
    let days = window.days();
    let first_day = window.start.date_naive();

    let mut keys: Vec<String> = variant_keys.to_vec();
    if policy == MultipleVariantHandling::Exclude {
        keys.push(MULTIPLE_VARIANT_KEY.to_string());
    }

    let mut daily: BTreeMap<String, Vec<u64>> = keys
        .iter()
        .map(|k| (k.clone(), vec![0; days.len()]))
        .collect();
    let mut total_exposures: BTreeMap<String, u64> =
        keys.iter().map(|k| (k.clone(), 0)).collect();

    for decision in decisions.iter() {
        let key = match &decision.assignment {
            Assignment::Multiple if policy != MultipleVariantHandling::Exclude => continue,
            assignment => assignment.key(),
        };
        let Some(counts) = daily.get_mut(key) else {
            continue;
        };
        let offset = (decision.first_exposure.date_naive() - first_day).num_days();
        let Some(slot) = usize::try_from(offset).ok().and_then(|i| counts.get_mut(i)) else {
            continue;
        };
        *slot += 1;
        if let Some(total) = total_exposures.get_mut(key) {
            *total += 1;
        }
    }

    let series = daily
        .into_iter()
        .map(|(key, counts)| {
            let cumulative = counts
                .iter()
                .scan(0u64, |running, n| {
                    *running += n;
                    Some(*running)
                })
                .collect();
            (key, cumulative)
        })
        .collect();

    ExposureTimeseries {
        days,
        series,
        total_exposures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExposureDecision;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, day, 15, 0, 0).unwrap()
    }

    fn decision(subject: &str, assignment: Assignment, day: u32) -> ExposureDecision {
        ExposureDecision {
            subject_id: subject.to_string(),
            assignment,
            first_exposure: at(day),
            breakdown: None,
        }
    }

    fn window() -> AnalysisWindow {
        AnalysisWindow {
            start: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2020, 1, 5, 0, 0, 0).unwrap(),
            end_inclusive: true,
        }
    }

    fn keys() -> Vec<String> {
        vec!["control".to_string(), "test".to_string()]
    }

    #[test]
    fn test_cumulative_and_monotonic() {
        let decisions: ExposureDecisions = vec![
            decision("a", Assignment::Variant("control".into()), 1),
            decision("b", Assignment::Variant("control".into()), 3),
            decision("c", Assignment::Variant("test".into()), 3),
            decision("d", Assignment::Variant("control".into()), 5),
            decision("e", Assignment::Multiple, 2),
        ]
        .into_iter()
        .collect();

        let ts = build_timeseries(&decisions, &keys(), MultipleVariantHandling::Exclude, &window());

        assert_eq!(ts.days.len(), 5);
        assert_eq!(ts.series["control"], vec![1, 1, 2, 2, 3]);
        assert_eq!(ts.series["test"], vec![0, 0, 1, 1, 1]);
        assert_eq!(ts.series[MULTIPLE_VARIANT_KEY], vec![0, 1, 1, 1, 1]);

        for (key, series) in &ts.series {
            assert!(series.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(series.last().copied(), Some(ts.total_exposures[key]));
        }
    }

    #[test]
    fn test_first_seen_has_no_sentinel() {
        let decisions: ExposureDecisions =
            vec![decision("a", Assignment::Variant("test".into()), 2)]
                .into_iter()
                .collect();
        let ts = build_timeseries(&decisions, &keys(), MultipleVariantHandling::FirstSeen, &window());

        assert!(!ts.series.contains_key(MULTIPLE_VARIANT_KEY));
        assert_eq!(ts.total_exposures["test"], 1);
        assert_eq!(ts.total_exposures["control"], 0);
    }
}
