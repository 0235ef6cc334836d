//! Unsupervised anomaly scoring and behavioral clustering.
//!
//! [`analyze`] is a pure function of (windows, hyperparameters, seed): every
//! model it fits lives only inside the call. It runs once per entity kind.
//! Window outliers come from an isolation forest over standardized window
//! features; entities are clustered with k-means over per-entity summaries
//! and each cluster gets an [`Archetype`]. Degenerate or undersized input is
//! absorbed into [`MlFlag`]s; only numerical failure is an error.

pub mod archetype;
pub mod isolation;
pub mod kmeans;
pub mod scale;

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analysis::{EntityKind, EntityWindow, WindowId};
use crate::config::MlConfig;
pub use archetype::{Archetype, EntitySummary};
use isolation::IsolationForest;

/// Silhouette is quadratic in entity count; skip it above this size.
pub const SILHOUETTE_MAX_ENTITIES: usize = 2000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MlError {
    #[error("insufficient data: need at least {needed}, have {have}")]
    InsufficientData { needed: usize, have: usize },
    #[error("model fit failed: {0}")]
    ModelFit(String),
}

/// Degraded-mode conditions recorded instead of failing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum MlFlag {
    /// Too few windows to fit an outlier model; scores are neutral.
    InsufficientWindows { have: usize },
    /// Every window feature is constant; no outliers flagged.
    DegenerateWindowFeatures,
    /// No entities to cluster.
    InsufficientEntities { have: usize },
    /// Every entity summary is identical; one uniform cluster emitted.
    DegenerateEntityFeatures,
    /// Fewer clusters than requested were fitted.
    ReducedClusterCount { requested: usize, used: usize },
}

/// Per-window ML output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyRecord {
    pub window: WindowId,
    pub kind: EntityKind,
    pub entity: String,
    /// Isolation score in (0, 1]; higher is more anomalous.
    pub score: f64,
    pub is_outlier: bool,
    /// Cluster of the window's entity. Only meaningful within one run.
    pub cluster: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub id: usize,
    pub archetype: Archetype,
    pub size: usize,
    /// Mean of each raw (unscaled) summary field over the members.
    pub centroid: BTreeMap<String, f64>,
    pub members: Vec<String>,
}

/// Results for one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindReport {
    pub kind: EntityKind,
    pub windows: usize,
    pub outliers: usize,
    pub clusters: Vec<Cluster>,
    /// Entity id to cluster id.
    pub assignments: BTreeMap<String, usize>,
    pub silhouette: Option<f64>,
    pub flags: Vec<MlFlag>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BehaviorReport {
    /// One record per window, in window-id order.
    pub records: Vec<AnomalyRecord>,
    pub kinds: Vec<KindReport>,
}

impl BehaviorReport {
    fn kind(&self, kind: EntityKind) -> Option<&KindReport> {
        self.kinds.iter().find(|k| k.kind == kind)
    }

    pub fn archetype_of(&self, kind: EntityKind, entity: &str) -> Option<Archetype> {
        let report = self.kind(kind)?;
        let id = *report.assignments.get(entity)?;
        report.clusters.iter().find(|c| c.id == id).map(|c| c.archetype)
    }

    /// Highest window score of an entity.
    pub fn max_score(&self, kind: EntityKind, entity: &str) -> Option<f64> {
        self.records
            .iter()
            .filter(|r| r.kind == kind && r.entity == entity)
            .map(|r| r.score)
            .reduce(f64::max)
    }

    pub fn outlier_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_outlier).count()
    }
}

/// Score every window and cluster every entity, per entity kind.
pub fn analyze(windows: &[EntityWindow], config: &MlConfig) -> Result<BehaviorReport, MlError> {
    let mut report = BehaviorReport::default();
    for kind in EntityKind::ALL {
        let mut of_kind: Vec<&EntityWindow> = windows.iter().filter(|w| w.kind() == kind).collect();
        if of_kind.is_empty() {
            continue;
        }
        of_kind.sort_by(|a, b| a.id.cmp(&b.id));
        let (records, kind_report) = analyze_kind(kind, &of_kind, config)?;
        info!(
            %kind,
            windows = kind_report.windows,
            outliers = kind_report.outliers,
            clusters = kind_report.clusters.len(),
            flags = kind_report.flags.len(),
            "behavior analysis complete"
        );
        report.records.extend(records);
        report.kinds.push(kind_report);
    }
    Ok(report)
}

fn analyze_kind(
    kind: EntityKind,
    windows: &[&EntityWindow],
    config: &MlConfig,
) -> Result<(Vec<AnomalyRecord>, KindReport), MlError> {
    let mut flags = Vec::new();

    let (scores, outliers) = score_windows(windows, config, &mut flags)?;
    let summaries = EntitySummary::from_windows(windows.iter().copied());
    let clustering = cluster_entities(&summaries, config, &mut flags)?;

    let records: Vec<AnomalyRecord> = windows
        .iter()
        .enumerate()
        .map(|(i, w)| AnomalyRecord {
            window: w.id.clone(),
            kind,
            entity: w.entity().to_string(),
            score: scores[i],
            is_outlier: outliers.binary_search(&i).is_ok(),
            cluster: clustering.assignments.get(w.entity()).copied(),
        })
        .collect();

    for flag in &flags {
        warn!(%kind, ?flag, "behavior analysis degraded");
    }
    let kind_report = KindReport {
        kind,
        windows: windows.len(),
        outliers: outliers.len(),
        clusters: clustering.clusters,
        assignments: clustering.assignments,
        silhouette: clustering.silhouette,
        flags,
    };
    Ok((records, kind_report))
}

fn score_windows(
    windows: &[&EntityWindow],
    config: &MlConfig,
    flags: &mut Vec<MlFlag>,
) -> Result<(Vec<f64>, Vec<usize>), MlError> {
    let neutral = vec![0.5; windows.len()];
    if windows.len() < 2 {
        flags.push(MlFlag::InsufficientWindows { have: windows.len() });
        return Ok((neutral, Vec::new()));
    }

    let matrix: Vec<Vec<f64>> = windows.iter().map(|w| w.features.to_vector()).collect();
    let (scaler, scaled) = scale::standardize(&matrix)?;
    if scaler.is_degenerate() {
        flags.push(MlFlag::DegenerateWindowFeatures);
        return Ok((neutral, Vec::new()));
    }

    let forest = IsolationForest::fit(&scaled, config.trees, config.sample_size, config.seed)?;
    let scores = forest.score_all(&scaled);
    if scores.iter().any(|s| !s.is_finite()) {
        return Err(MlError::ModelFit("isolation forest produced non-finite scores".into()));
    }
    let ids: Vec<&WindowId> = windows.iter().map(|w| &w.id).collect();
    let outliers = isolation::top_outliers(&scores, config.contamination, &ids);
    debug!(windows = windows.len(), outliers = outliers.len(), "isolation forest scored");
    Ok((scores, outliers))
}

struct Clustering {
    clusters: Vec<Cluster>,
    assignments: BTreeMap<String, usize>,
    silhouette: Option<f64>,
}

fn cluster_entities(
    summaries: &[EntitySummary],
    config: &MlConfig,
    flags: &mut Vec<MlFlag>,
) -> Result<Clustering, MlError> {
    if summaries.is_empty() {
        flags.push(MlFlag::InsufficientEntities { have: 0 });
        return Ok(Clustering {
            clusters: Vec::new(),
            assignments: BTreeMap::new(),
            silhouette: None,
        });
    }

    let matrix: Vec<Vec<f64>> = summaries.iter().map(EntitySummary::to_vector).collect();
    let (scaler, scaled) = scale::standardize(&matrix)?;
    if scaler.is_degenerate() {
        flags.push(MlFlag::DegenerateEntityFeatures);
        let members: Vec<&EntitySummary> = summaries.iter().collect();
        return Ok(Clustering {
            clusters: vec![Cluster {
                id: 0,
                archetype: Archetype::Uniform,
                size: summaries.len(),
                centroid: archetype::centroid(&members),
                members: summaries.iter().map(|s| s.entity.clone()).collect(),
            }],
            assignments: summaries.iter().map(|s| (s.entity.clone(), 0)).collect(),
            silhouette: None,
        });
    }

    let k = config
        .clusters
        .min(summaries.len())
        .min(kmeans::distinct_points(&scaled));
    if k < config.clusters {
        flags.push(MlFlag::ReducedClusterCount {
            requested: config.clusters,
            used: k,
        });
    }

    let fit = kmeans::fit(&scaled, k, config.max_iterations, config.restarts, config.seed)?;
    let silhouette = if summaries.len() <= SILHOUETTE_MAX_ENTITIES && k >= 2 {
        kmeans::silhouette(&scaled, &fit.assignments)
    } else {
        None
    };

    let member_idx = fit.members();
    let centroids: Vec<BTreeMap<String, f64>> = member_idx
        .iter()
        .map(|idx| archetype::centroid(&idx.iter().map(|&i| &summaries[i]).collect::<Vec<_>>()))
        .collect();
    let labels = archetype::label(&centroids, summaries, config.suspicious_error_rate);

    let clusters = member_idx
        .iter()
        .zip(centroids)
        .zip(labels)
        .enumerate()
        .filter(|(_, ((idx, _), _))| !idx.is_empty())
        .map(|(id, ((idx, centroid), archetype))| Cluster {
            id,
            archetype,
            size: idx.len(),
            centroid,
            members: idx.iter().map(|&i| summaries[i].entity.clone()).collect(),
        })
        .collect();
    let assignments = summaries
        .iter()
        .zip(&fit.assignments)
        .map(|(s, &c)| (s.entity.clone(), c))
        .collect();
    debug!(k, inertia = fit.inertia, ?silhouette, "entities clustered");
    Ok(Clustering {
        clusters,
        assignments,
        silhouette,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregator::tests::{event, failed_login};
    use crate::analysis::FeatureAggregator;
    use crate::config::WindowConfig;
    use crate::normalize::LogEvent;

    fn traffic() -> Vec<LogEvent> {
        let mut events = Vec::new();
        let mut id = 0;
        // Thirty quiet clients, a few requests every window.
        for c in 0..30 {
            for bucket in 0..4i64 {
                for r in 0..3 {
                    id += 1;
                    let mut e = event(id, bucket * 300 + r * 20, &format!("10.0.1.{}", c), None);
                    e.path = Some(format!("/page/{}", r));
                    events.push(e);
                }
            }
        }
        // One scraper hammering a single endpoint.
        for r in 0..400 {
            id += 1;
            let mut e = event(id, r, "10.9.9.9", None);
            e.path = Some("/catalog".into());
            events.push(e);
        }
        // One attacker failing logins.
        for r in 0..40 {
            id += 1;
            events.push(failed_login(id, r * 5, "10.6.6.6", &format!("u{}", r % 4)));
        }
        events
    }

    fn windows(events: &[LogEvent]) -> Vec<EntityWindow> {
        FeatureAggregator::new(&WindowConfig::default(), 1).aggregate(events, EntityKind::Ip)
    }

    #[test]
    fn heavy_windows_are_outliers_and_labelled() {
        let events = traffic();
        let windows = windows(&events);
        let report = analyze(&windows, &MlConfig::default()).unwrap();

        assert_eq!(report.records.len(), windows.len());
        let flagged: Vec<&AnomalyRecord> = report.records.iter().filter(|r| r.is_outlier).collect();
        let expected = (0.05 * windows.len() as f64).ceil() as usize;
        assert_eq!(flagged.len(), expected);
        assert!(flagged.iter().any(|r| r.entity == "10.9.9.9"));

        assert_eq!(
            report.archetype_of(EntityKind::Ip, "10.6.6.6"),
            Some(Archetype::Suspicious)
        );
        assert_eq!(
            report.archetype_of(EntityKind::Ip, "10.9.9.9"),
            Some(Archetype::Scraper)
        );
        let kind = &report.kinds[0];
        assert!(kind.silhouette.is_some());
        // Quiet clients are identical, so only three distinct profiles exist.
        assert_eq!(
            kind.flags,
            vec![MlFlag::ReducedClusterCount {
                requested: 4,
                used: 3
            }]
        );
    }

    #[test]
    fn reruns_agree() {
        let events = traffic();
        let windows = windows(&events);
        let a = analyze(&windows, &MlConfig::default()).unwrap();
        let b = analyze(&windows, &MlConfig::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cluster_count_reduced_to_entities() {
        let events = vec![
            event(1, 0, "10.0.0.1", None),
            event(2, 1, "10.0.0.1", None),
            event(3, 0, "10.0.0.2", None),
        ];
        let windows = windows(&events);
        let report = analyze(&windows, &MlConfig::default()).unwrap();
        let kind = &report.kinds[0];
        assert!(kind.flags.contains(&MlFlag::ReducedClusterCount {
            requested: 4,
            used: 2
        }));
        assert_eq!(kind.clusters.len(), 2);
    }

    #[test]
    fn identical_entities_form_one_uniform_cluster() {
        let events: Vec<LogEvent> = (0..5)
            .map(|i| event(i, 0, &format!("10.0.0.{}", i), None))
            .collect();
        let windows = windows(&events);
        let report = analyze(&windows, &MlConfig::default()).unwrap();
        let kind = &report.kinds[0];
        assert_eq!(kind.clusters.len(), 1);
        assert_eq!(kind.clusters[0].archetype, Archetype::Uniform);
        assert!(kind.flags.contains(&MlFlag::DegenerateWindowFeatures));
        assert!(kind.flags.contains(&MlFlag::DegenerateEntityFeatures));
        assert!(report.records.iter().all(|r| !r.is_outlier && r.score == 0.5));
    }

    #[test]
    fn empty_input_is_empty_report() {
        let report = analyze(&[], &MlConfig::default()).unwrap();
        assert!(report.records.is_empty());
        assert!(report.kinds.is_empty());
    }

    #[test]
    fn single_window_gets_neutral_score() {
        let events = vec![event(1, 0, "10.0.0.1", None)];
        let windows = windows(&events);
        let report = analyze(&windows, &MlConfig::default()).unwrap();
        assert_eq!(report.records[0].score, 0.5);
        assert!(report.kinds[0]
            .flags
            .contains(&MlFlag::InsufficientWindows { have: 1 }));
        assert_eq!(report.max_score(EntityKind::Ip, "10.0.0.1"), Some(0.5));
    }
}
