use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::artifacts::{ArtifactError, QueryView, ReidArtifacts};

const DEFAULT_TOP_K: usize = 10;

/// How a score in the matrix is to be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    /// Lower is a better match.
    #[default]
    Distance,
    /// Higher is a better match.
    Similarity,
}

impl ScoreKind {
    /// Prefix used in tile captions.
    pub fn label(self) -> &'static str {
        match self {
            ScoreKind::Distance => "dist",
            ScoreKind::Similarity => "sim",
        }
    }

    /// Orders `a` before `b` when it is the better match. NaN always sorts last.
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
                match self {
                    ScoreKind::Distance => ord,
                    ScoreKind::Similarity => ord.reverse(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub top_k: usize,
    /// Drop gallery entries taken by the query's own camera.
    pub exclude_same_camera: bool,
    pub score_kind: ScoreKind,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            exclude_same_camera: false,
            score_kind: ScoreKind::Distance,
        }
    }
}

/// One selected gallery entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryMatch {
    /// 1-based position in the ranking.
    pub rank: usize,
    pub gallery_index: usize,
    pub img_path: String,
    pub pid: Option<String>,
    pub camid: Option<String>,
    pub score: f64,
    /// Same identity as the query; `None` when labels are unknown.
    pub correct: Option<bool>,
    /// Same camera as the query; `None` when labels are unknown.
    pub same_cam: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedMatches {
    pub query: QueryView,
    pub score_kind: ScoreKind,
    pub excluded_same_camera: bool,
    pub labels_known: bool,
    pub matches: Vec<GalleryMatch>,
}

/// `true` for every gallery entry whose camera equals `query_camid`.
pub fn same_camera_mask(gallery_camids: &[String], query_camid: &str) -> Vec<bool> {
    gallery_camids.iter().map(|c| c == query_camid).collect()
}

/// Indices of the `k` best-scored gallery entries not flagged in `exclude`.
///
/// The sort is stable over ascending index, so equal scores keep index order.
pub fn rank_gallery(
    scores: &[f64],
    exclude: Option<&[bool]>,
    kind: ScoreKind,
    k: usize,
) -> Vec<usize> {
    let mut candidates: Vec<usize> = (0..scores.len())
        .filter(|&i| !exclude.is_some_and(|mask| mask.get(i).copied().unwrap_or(false)))
        .collect();
    candidates.sort_by(|&a, &b| kind.compare(scores[a], scores[b]));
    candidates.truncate(k);
    candidates
}

/// Ranks the gallery for one query and attaches labels and correctness flags.
pub fn build_matches(
    artifacts: &ReidArtifacts,
    query_index: usize,
    config: &RankingConfig,
) -> Result<RankedMatches, ArtifactError> {
    let query = artifacts.query(query_index)?;
    let scores: Vec<f64> = artifacts.distance_row(query_index)?.iter().copied().collect();

    let mask = match (config.exclude_same_camera, artifacts.gallery_camids(), &query.camid) {
        (false, ..) => None,
        (true, Some(camids), Some(q_camid)) => Some(same_camera_mask(camids, q_camid)),
        (true, ..) => {
            warn!("camera labels unknown; same-camera exclusion skipped");
            None
        }
    };
    if let Some(m) = &mask {
        debug!(
            "excluding {} same-camera gallery entries for query {query_index}",
            m.iter().filter(|&&x| x).count()
        );
    }

    let selected = rank_gallery(&scores, mask.as_deref(), config.score_kind, config.top_k);

    let matches = selected
        .into_iter()
        .enumerate()
        .map(|(pos, g)| {
            let pid = artifacts.gallery_pid(g).map(str::to_string);
            let camid = artifacts.gallery_camid(g).map(str::to_string);
            let correct = pid.as_ref().zip(query.pid.as_ref()).map(|(a, b)| a == b);
            let same_cam = camid.as_ref().zip(query.camid.as_ref()).map(|(a, b)| a == b);
            GalleryMatch {
                rank: pos + 1,
                gallery_index: g,
                img_path: artifacts.gallery_path(g).to_string(),
                pid,
                camid,
                score: scores[g],
                correct,
                same_cam,
            }
        })
        .collect();

    Ok(RankedMatches {
        query,
        score_kind: config.score_kind,
        excluded_same_camera: mask.is_some(),
        labels_known: artifacts.labels.is_some(),
        matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::Labels;
    use ndarray::array;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn picks_two_smallest_distances() {
        let row = [0.9, 0.1, 0.5, 0.3];
        let top = rank_gallery(&row, None, ScoreKind::Distance, 2);
        assert_eq!(top, vec![1, 3]);
        let scores: Vec<f64> = top.iter().map(|&i| row[i]).collect();
        assert_eq!(scores, vec![0.1, 0.3]);
    }

    #[test]
    fn same_camera_entries_are_dropped() {
        let row = [0.9, 0.1, 0.5, 0.3];
        let cams = strings(&["002", "001", "002", "001"]);
        let mask = same_camera_mask(&cams, "002");
        assert_eq!(mask, vec![true, false, true, false]);

        let top = rank_gallery(&row, Some(&mask[..]), ScoreKind::Distance, 2);
        assert_eq!(top, vec![1, 3]);
    }

    #[test]
    fn exclusion_can_reach_past_nearest_entries() {
        let row = [0.05, 0.1, 0.5, 0.3];
        let mask = [true, false, false, true];
        assert_eq!(rank_gallery(&row, Some(&mask[..]), ScoreKind::Distance, 2), vec![1, 2]);
    }

    #[test]
    fn ties_keep_index_order() {
        let row = [0.2, 0.1, 0.2, 0.1, 0.2];
        assert_eq!(
            rank_gallery(&row, None, ScoreKind::Distance, 5),
            vec![1, 3, 0, 2, 4]
        );
    }

    #[test]
    fn similarity_ranks_descending() {
        let row = [0.9, 0.1, 0.5, 0.3];
        assert_eq!(rank_gallery(&row, None, ScoreKind::Similarity, 3), vec![0, 2, 3]);
    }

    #[test]
    fn nan_scores_sort_last() {
        let row = [f64::NAN, 0.4, 0.2];
        assert_eq!(rank_gallery(&row, None, ScoreKind::Distance, 3), vec![2, 1, 0]);
        assert_eq!(rank_gallery(&row, None, ScoreKind::Similarity, 3), vec![1, 2, 0]);
    }

    #[test]
    fn k_larger_than_gallery_returns_all() {
        assert_eq!(rank_gallery(&[0.3, 0.2], None, ScoreKind::Distance, 10), vec![1, 0]);
        assert!(rank_gallery(&[], None, ScoreKind::Distance, 10).is_empty());
    }

    #[test]
    fn exclusion_never_improves_scores() {
        let row = [0.7, 0.2, 0.9, 0.1, 0.4, 0.4, 0.3, 0.8];
        let mask = [false, true, false, true, false, false, true, false];
        for k in 1..=row.len() {
            let all = rank_gallery(&row, None, ScoreKind::Distance, k);
            let kept = rank_gallery(&row, Some(&mask[..]), ScoreKind::Distance, k);
            for (pos, &i) in kept.iter().enumerate() {
                assert!(row[i] >= row[all[pos]], "k={k} pos={pos}");
                assert!(!mask[i]);
            }
        }
    }

    fn artifacts(labels: Option<Labels>) -> ReidArtifacts {
        ReidArtifacts::new(
            array![[0.9, 0.1, 0.5, 0.3], [0.2, 0.2, 0.2, 0.2]],
            strings(&["q0", "q1", "g0", "g1", "g2", "g3"]),
            2,
            labels,
        )
        .expect("valid artifacts")
    }

    fn labels() -> Labels {
        Labels {
            pids: strings(&["5", "6", "9", "7", "5", "8"]),
            camids: strings(&["002", "003", "002", "001", "002", "001"]),
        }
    }

    #[test]
    fn matches_carry_flags() {
        let a = artifacts(Some(labels()));
        let cfg = RankingConfig {
            top_k: 4,
            ..RankingConfig::default()
        };
        let ranked = build_matches(&a, 0, &cfg).expect("ranked");
        let idx: Vec<usize> = ranked.matches.iter().map(|m| m.gallery_index).collect();
        assert_eq!(idx, vec![1, 3, 2, 0]);

        let m = &ranked.matches[0];
        assert_eq!(m.rank, 1);
        assert_eq!(m.img_path, "g1");
        assert_eq!(m.correct, Some(false));
        assert_eq!(m.same_cam, Some(false));

        // g2: same pid, same camera
        let m = &ranked.matches[2];
        assert_eq!(m.rank, 3);
        assert_eq!(m.correct, Some(true));
        assert_eq!(m.same_cam, Some(true));

        // g0: other pid, same camera
        assert_eq!(ranked.matches[3].correct, Some(false));
        assert_eq!(ranked.matches[3].same_cam, Some(true));
        assert!(ranked.labels_known);
        assert!(!ranked.excluded_same_camera);
    }

    #[test]
    fn exclusion_uses_query_camera() {
        let a = artifacts(Some(labels()));
        let cfg = RankingConfig {
            top_k: 2,
            exclude_same_camera: true,
            ..RankingConfig::default()
        };
        let ranked = build_matches(&a, 0, &cfg).expect("ranked");
        let idx: Vec<usize> = ranked.matches.iter().map(|m| m.gallery_index).collect();
        assert_eq!(idx, vec![1, 3]);
        assert!(ranked.matches.iter().all(|m| m.same_cam == Some(false)));
        assert!(ranked.excluded_same_camera);
    }

    #[test]
    fn unknown_labels_leave_flags_unset() {
        let a = artifacts(None);
        let cfg = RankingConfig {
            exclude_same_camera: true,
            ..RankingConfig::default()
        };
        let ranked = build_matches(&a, 0, &cfg).expect("ranked");
        assert_eq!(ranked.matches.len(), 4);
        assert!(!ranked.excluded_same_camera);
        assert!(!ranked.labels_known);
        assert!(ranked.matches.iter().all(|m| m.correct.is_none() && m.same_cam.is_none()));
        assert_eq!(ranked.query.pid, None);
    }

    #[test]
    fn query_index_is_checked() {
        let a = artifacts(None);
        let err = build_matches(&a, 2, &RankingConfig::default()).expect_err("out of range");
        assert!(matches!(err, ArtifactError::QueryOutOfRange { .. }));
    }
}
