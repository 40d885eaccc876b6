use std::sync::RwLock;

use crate::data::{self, repository, Db};
use crate::error::AppError;
use crate::models::classification::{Category, ClassificationResult, Modality};
use crate::models::learning::{LearningEvent, LearningStats, OutcomeCounts};

#[derive(Debug, Clone, Copy)]
pub struct BiasConfig {
    pub max_bias: f64,
    /// Decided outcomes needed before the bias reaches full strength.
    pub min_samples: u64,
    pub checkpoint_every: u64,
}

pub struct LearningStore {
    db: Db,
    config: BiasConfig,
    cache: RwLock<Cache>,
}

#[derive(Default)]
struct Cache {
    stats: LearningStats,
    since_checkpoint: u64,
}

impl LearningStore {
    /// Loads the last checkpoint and folds in only the events recorded after it.
    pub fn open(db: Db, config: BiasConfig) -> Result<Self, AppError> {
        let stats = {
            let conn = data::lock(&db);
            let mut stats = repository::load_stats_checkpoint(&conn)?.unwrap_or_default();
            let newer = repository::list_learning_events_after(&conn, stats.last_event_id)?;
            let replayed = newer.len();
            for (id, event) in &newer {
                stats.apply(*id, event);
            }
            tracing::info!(
                events = stats.total_events,
                replayed,
                "loaded learning statistics"
            );
            stats
        };

        Ok(Self {
            db,
            config,
            cache: RwLock::new(Cache {
                stats,
                since_checkpoint: 0,
            }),
        })
    }

    /// Appends `event` to the log and folds it into the cache.
    pub fn record(&self, event: &LearningEvent) -> Result<i64, AppError> {
        let conn = data::lock(&self.db);
        let id = repository::insert_learning_event(&conn, event)?;

        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        cache.stats.apply(id, event);
        cache.since_checkpoint += 1;
        if self.config.checkpoint_every > 0 && cache.since_checkpoint >= self.config.checkpoint_every
        {
            // A failed checkpoint only costs a longer replay at next startup.
            match repository::save_stats_checkpoint(&conn, &cache.stats) {
                Ok(()) => cache.since_checkpoint = 0,
                Err(e) => tracing::warn!(error = %e, "learning checkpoint failed"),
            }
        }

        tracing::debug!(
            event_id = id,
            category = %event.category,
            action = %event.action,
            overridden = event.overridden,
            "recorded learning event"
        );
        Ok(id)
    }

    pub fn stats(&self) -> LearningStats {
        self.cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .stats
            .clone()
    }

    /// Replays the entire log, replaces the cache and writes a fresh checkpoint.
    pub fn rebuild(&self) -> Result<LearningStats, AppError> {
        let conn = data::lock(&self.db);
        let stats = replay(&repository::list_learning_events_after(&conn, 0)?);
        repository::save_stats_checkpoint(&conn, &stats)?;

        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        cache.stats = stats.clone();
        cache.since_checkpoint = 0;
        tracing::info!(events = stats.total_events, "rebuilt learning statistics");
        Ok(stats)
    }

    pub fn checkpoint(&self) -> Result<(), AppError> {
        let conn = data::lock(&self.db);
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        repository::save_stats_checkpoint(&conn, &cache.stats)?;
        cache.since_checkpoint = 0;
        Ok(())
    }

    /// Confidence shift in `[-max_bias, max_bias]`, growing with the historical
    /// acceptance rate for the category (or the modality when the category is new).
    pub fn bias(&self, category: &Category, modality: Modality) -> f64 {
        let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
        let counts = cache
            .stats
            .category(category)
            .filter(|c| c.decided() > 0)
            .or_else(|| cache.stats.modality(modality));
        counts
            .map(|c| bias_from_counts(c, &self.config))
            .unwrap_or(0.0)
    }

    /// `result` with the learned bias applied. A raw confidence under `floor` is never
    /// pushed upward; it may still be lowered.
    pub fn adjust(&self, result: &ClassificationResult, floor: f64) -> ClassificationResult {
        if result.category.is_unknown() {
            return result.clone();
        }
        let bias = self.bias(&result.category, result.modality);
        if bias == 0.0 || (bias > 0.0 && result.confidence < floor) {
            return result.clone();
        }
        result.with_confidence(result.confidence + bias)
    }

    pub fn known_categories(&self) -> Vec<Category> {
        self.cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .stats
            .by_category
            .keys()
            .filter(|c| !c.is_unknown())
            .cloned()
            .collect()
    }
}

pub fn replay(events: &[(i64, LearningEvent)]) -> LearningStats {
    let mut stats = LearningStats::default();
    for (id, event) in events {
        stats.apply(*id, event);
    }
    stats
}

fn bias_from_counts(counts: &OutcomeCounts, config: &BiasConfig) -> f64 {
    let decided = counts.decided();
    if decided == 0 {
        return 0.0;
    }
    let rate = counts.accepted as f64 / decided as f64;
    let strength = (decided as f64 / config.min_samples.max(1) as f64).min(1.0);
    (config.max_bias * (2.0 * rate - 1.0) * strength).clamp(-config.max_bias, config.max_bias)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;

    use super::*;
    use crate::models::decision::DecisionAction;
    use crate::models::learning::EventSource;

    const CONFIG: BiasConfig = BiasConfig {
        max_bias: 0.05,
        min_samples: 10,
        checkpoint_every: 3,
    };

    fn event(category: &str, confidence: f64, action: DecisionAction, overridden: bool) -> LearningEvent {
        LearningEvent {
            file_path: format!("/staging/{category}.pdf"),
            category: Category::lenient(category),
            modality: Modality::Text,
            confidence: Some(confidence),
            action,
            overridden,
            source: EventSource::Classifier,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn record_updates_cache_and_checkpoints() {
        let db = data::test_db();
        let store = LearningStore::open(db.clone(), CONFIG).unwrap();

        for _ in 0..3 {
            store
                .record(&event("financial", 0.9, DecisionAction::AutoFile, false))
                .unwrap();
        }
        store
            .record(&LearningEvent::admission_skip("/staging/huge.mov"))
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.admission_skips, 1);

        let checkpoint = repository::load_stats_checkpoint(&data::lock(&db))
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.total_events, 3);
    }

    #[test]
    fn reopen_replays_events_after_checkpoint() {
        let db = data::test_db();
        let store = LearningStore::open(db.clone(), CONFIG).unwrap();
        for i in 0..5 {
            store
                .record(&event("audio", 0.5 + i as f64 * 0.1, DecisionAction::AskUser, false))
                .unwrap();
        }
        let before = store.stats();
        drop(store);

        let reopened = LearningStore::open(db, CONFIG).unwrap();
        assert_eq!(reopened.stats(), before);
    }

    #[test]
    fn bias_tracks_acceptance_and_is_bounded() {
        let store = LearningStore::open(data::test_db(), CONFIG).unwrap();
        let financial = Category::lenient("financial");
        assert_eq!(store.bias(&financial, Modality::Text), 0.0);

        for _ in 0..20 {
            store
                .record(&event("financial", 0.8, DecisionAction::AutoFile, false))
                .unwrap();
        }
        assert!((store.bias(&financial, Modality::Text) - 0.05).abs() < 1e-12);

        for _ in 0..20 {
            store
                .record(&event("memes", 0.8, DecisionAction::AutoFile, true))
                .unwrap();
        }
        assert!((store.bias(&Category::lenient("memes"), Modality::Text) + 0.05).abs() < 1e-12);

        // Unseen category falls back to the modality tally (20 accepted, 20 overridden).
        assert!(store.bias(&Category::lenient("recipes"), Modality::Text).abs() < 1e-12);
    }

    #[test]
    fn adjust_never_lifts_low_confidence() {
        let store = LearningStore::open(data::test_db(), CONFIG).unwrap();
        for _ in 0..10 {
            store
                .record(&event("financial", 0.8, DecisionAction::AutoFile, false))
                .unwrap();
        }
        let low = ClassificationResult::new(
            Category::lenient("financial"),
            0.39,
            "Weak signal.",
            Modality::Text,
        );
        assert_eq!(store.adjust(&low, 0.40).confidence, 0.39);

        let mid = low.with_confidence(0.67);
        assert!((store.adjust(&mid, 0.40).confidence - 0.72).abs() < 1e-12);

        let unknown = ClassificationResult::new(Category::unknown(), 0.6, "?", Modality::Text);
        assert_eq!(store.adjust(&unknown, 0.40).confidence, 0.6);
    }

    #[test]
    fn rebuild_matches_cache() {
        let db = data::test_db();
        let store = LearningStore::open(db, CONFIG).unwrap();
        store.record(&event("a", 0.31, DecisionAction::Skip, false)).unwrap();
        store.record(&event("b", 0.77, DecisionAction::AutoFile, true)).unwrap();
        let cached = store.stats();
        assert_eq!(store.rebuild().unwrap(), cached);
        assert_eq!(store.known_categories().len(), 2);
    }

    fn arb_event() -> impl Strategy<Value = LearningEvent> {
        (
            prop::sample::select(vec!["financial", "audio", "images", "unknown"]),
            prop::option::of(0.0f64..=1.0),
            prop::sample::select(vec![
                DecisionAction::AutoFile,
                DecisionAction::AskUser,
                DecisionAction::Skip,
            ]),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(category, confidence, action, overridden, admission)| {
                if admission {
                    LearningEvent::admission_skip("/staging/big.iso")
                } else {
                    LearningEvent {
                        confidence,
                        ..event(category, 0.0, action, overridden)
                    }
                }
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn rebuilt_stats_equal_incremental_cache(events in prop::collection::vec(arb_event(), 0..40)) {
            let store = LearningStore::open(data::test_db(), CONFIG).unwrap();
            for e in &events {
                store.record(e).unwrap();
            }
            let incremental = store.stats();
            prop_assert_eq!(store.rebuild().unwrap(), incremental);
        }

        #[test]
        fn bias_is_monotonic_and_bounded(accepted in 0u64..50, overridden in 0u64..50, extra in 1u64..10) {
            let base = OutcomeCounts { events: accepted + overridden, accepted, overridden };
            let better = OutcomeCounts {
                events: base.events + extra,
                accepted: accepted + extra,
                overridden,
            };
            let b0 = bias_from_counts(&base, &CONFIG);
            let b1 = bias_from_counts(&better, &CONFIG);
            prop_assert!(b0.abs() <= CONFIG.max_bias + 1e-12);
            prop_assert!(b1.abs() <= CONFIG.max_bias + 1e-12);
            // Raising the acceptance rate at the same sample count never lowers the bias.
            if accepted + overridden > 0 {
                let flipped = OutcomeCounts {
                    events: base.events,
                    accepted: base.accepted + base.overridden.min(1),
                    overridden: base.overridden - base.overridden.min(1),
                };
                prop_assert!(bias_from_counts(&flipped, &CONFIG) >= b0);
            }
        }
    }
}
