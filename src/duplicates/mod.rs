//! Near-duplicate photo grouping.
//!
//! Photos are nodes; any pair within the distance threshold is an edge.
//! Groups are the connected components of that graph, NOT cliques: if A-B
//! and B-C are within threshold, A, B and C share a group even when A-C is
//! far apart. Burst sequences chain together this way. Keep it that way.
//!
//! Edge generation and component extraction are separate stages.

mod union_find;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::config::DuplicateConfig;
use crate::db::{EmbeddingStore, ImageEmbedding, ImageNeighbor};
use crate::error::{check_limit, check_threshold, EngineError, Result};
use crate::similarity::cosine_distance;
use crate::tasks::CancelFlag;

pub use union_find::UnionFind;

/// First neighbor-query size per photo; doubled while still saturated.
const INITIAL_NEIGHBOR_QUERY: usize = 16;

/// A within-threshold pair, as indices into the scanned photo list (`a < b`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub a: usize,
    pub b: usize,
    pub distance: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DuplicateRequest {
    #[serde(default)]
    pub album_uid: Option<String>,
    #[serde(default)]
    pub distance_threshold: Option<f32>,
    #[serde(default)]
    pub group_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupEdge {
    pub photo_a: String,
    pub photo_b: String,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    /// Sorted ascending.
    pub photo_uids: Vec<String>,
    /// Within-threshold pairs that hold the group together.
    pub distances: Vec<GroupEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateResponse {
    pub groups: Vec<DuplicateGroup>,
    pub count: usize,
    /// True when `group_limit` dropped groups.
    pub truncated: bool,
    /// Photos with embeddings that were considered.
    pub scanned: usize,
}

/// Every pair `(i, j)` with `distance(i, j) <= threshold`.
pub fn threshold_edges<F>(n: usize, threshold: f32, distance: F) -> Vec<Edge>
where
    F: Fn(usize, usize) -> f32,
{
    let mut edges = Vec::new();
    for a in 0..n {
        for b in (a + 1)..n {
            let d = distance(a, b);
            if d <= threshold {
                edges.push(Edge { a, b, distance: d });
            }
        }
    }
    edges
}

/// O(n²) edge generation comparing every pair of photos.
pub fn pairwise_edges(
    photos: &[ImageEmbedding],
    threshold: f32,
    cancel: &CancelFlag,
) -> Result<Vec<Edge>> {
    let mut edges = Vec::new();
    for a in 0..photos.len() {
        cancel.check()?;
        for b in (a + 1)..photos.len() {
            let d = cosine_distance(&photos[a].embedding, &photos[b].embedding);
            if d <= threshold {
                edges.push(Edge { a, b, distance: d });
            }
        }
    }
    Ok(edges)
}

/// Edge generation through the store's nearest-neighbor query.
///
/// A query whose last neighbor is still within threshold may have cut off
/// further matches, so it is repeated with a doubled limit until the result
/// runs short or crosses the threshold. This keeps the edge set identical to
/// [`pairwise_edges`].
pub fn index_edges(
    store: &dyn EmbeddingStore,
    photos: &[ImageEmbedding],
    threshold: f32,
    cancel: &CancelFlag,
) -> Result<Vec<Edge>> {
    let position: HashMap<&str, usize> = photos
        .iter()
        .enumerate()
        .map(|(i, p)| (p.photo_uid.as_str(), i))
        .collect();

    let mut found: BTreeMap<(usize, usize), f32> = BTreeMap::new();

    for (i, photo) in photos.iter().enumerate() {
        cancel.check()?;
        let neighbors = complete_neighbors(store, &photo.embedding, threshold)?;
        for n in neighbors {
            if n.distance > threshold {
                break;
            }
            let j = match position.get(n.photo_uid.as_str()) {
                Some(&j) if j != i => j,
                _ => continue,
            };
            found.entry((i.min(j), i.max(j))).or_insert(n.distance);
        }
    }

    Ok(found
        .into_iter()
        .map(|((a, b), distance)| Edge { a, b, distance })
        .collect())
}

fn complete_neighbors(
    store: &dyn EmbeddingStore,
    vector: &[f32],
    threshold: f32,
) -> Result<Vec<ImageNeighbor>> {
    let mut k = INITIAL_NEIGHBOR_QUERY;
    loop {
        let neighbors = store.query_nearest_images(vector, k)?;
        let saturated = neighbors.len() >= k
            && neighbors.last().map_or(false, |n| n.distance <= threshold);
        if !saturated {
            return Ok(neighbors);
        }
        k = k.saturating_mul(2);
    }
}

/// Connected components with at least two members, each sorted ascending.
pub fn connected_components(n: usize, edges: &[Edge]) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::new(n);
    for e in edges {
        uf.union(e.a, e.b);
    }
    uf.groups().into_iter().filter(|g| g.len() > 1).collect()
}

/// Turn components into ordered groups: largest first, then lowest member
/// uid. Returns the groups kept and whether any were dropped.
pub fn build_groups(
    photos: &[ImageEmbedding],
    edges: &[Edge],
    group_limit: usize,
) -> (Vec<DuplicateGroup>, bool) {
    let components = connected_components(photos.len(), edges);

    let mut component_of: HashMap<usize, usize> = HashMap::new();
    for (c, members) in components.iter().enumerate() {
        for &m in members {
            component_of.insert(m, c);
        }
    }

    let mut groups: Vec<DuplicateGroup> = components
        .iter()
        .map(|members| {
            let mut photo_uids: Vec<String> =
                members.iter().map(|&i| photos[i].photo_uid.clone()).collect();
            photo_uids.sort();
            DuplicateGroup {
                photo_uids,
                distances: Vec::new(),
            }
        })
        .collect();

    for e in edges {
        if let Some(&c) = component_of.get(&e.a) {
            let (pa, pb) = (&photos[e.a].photo_uid, &photos[e.b].photo_uid);
            let (photo_a, photo_b) = if pa <= pb { (pa, pb) } else { (pb, pa) };
            groups[c].distances.push(GroupEdge {
                photo_a: photo_a.clone(),
                photo_b: photo_b.clone(),
                distance: e.distance,
            });
        }
    }

    for g in groups.iter_mut() {
        g.distances.sort_by(|x, y| {
            x.photo_a
                .cmp(&y.photo_a)
                .then_with(|| x.photo_b.cmp(&y.photo_b))
        });
    }

    groups.sort_by(|x, y| match y.photo_uids.len().cmp(&x.photo_uids.len()) {
        Ordering::Equal => x.photo_uids.first().cmp(&y.photo_uids.first()),
        other => other,
    });

    let truncated = groups.len() > group_limit;
    groups.truncate(group_limit);
    (groups, truncated)
}

/// Group near-duplicate photos in an album or across the corpus.
pub fn find_duplicates(
    store: &dyn EmbeddingStore,
    request: &DuplicateRequest,
    config: &DuplicateConfig,
    search_limit: usize,
    cancel: &CancelFlag,
) -> Result<DuplicateResponse> {
    let threshold = check_threshold(
        "distance_threshold",
        request.distance_threshold.unwrap_or(config.distance_threshold),
    )?;
    let group_limit = check_limit("group_limit", request.group_limit.unwrap_or(config.group_limit))?;
    let search_limit = check_limit("limit", search_limit)?;

    let album_uid = request.album_uid.as_deref().filter(|a| !a.is_empty());
    if let Some(album) = album_uid {
        if !store.list_albums()?.iter().any(|a| a.uid == album) {
            return Err(EngineError::NotFound(format!("album {:?}", album)));
        }
    }

    let photos: Vec<ImageEmbedding> = store
        .list_image_embeddings(album_uid, search_limit)?
        .into_iter()
        .filter(|p| !p.embedding.is_empty())
        .collect();

    let edges = if config.use_index {
        index_edges(store, &photos, threshold, cancel)?
    } else {
        pairwise_edges(&photos, threshold, cancel)?
    };
    debug!(photos = photos.len(), edges = edges.len(), threshold, "Duplicate edges built");

    let (groups, truncated) = build_groups(&photos, &edges, group_limit);
    info!(
        scope = album_uid.unwrap_or("all"),
        groups = groups.len(),
        truncated,
        "Duplicate grouping finished"
    );

    Ok(DuplicateResponse {
        count: groups.len(),
        groups,
        truncated,
        scanned: photos.len(),
    })
}

/// Photos most similar to `photo_uid`, closest first, excluding itself.
pub fn similar_photos(
    store: &dyn EmbeddingStore,
    photo_uid: &str,
    limit: usize,
) -> Result<Vec<ImageNeighbor>> {
    let limit = check_limit("limit", limit)?;
    let photo = store
        .get_image_embedding(photo_uid)?
        .filter(|p| !p.embedding.is_empty())
        .ok_or_else(|| EngineError::NotFound(format!("image embedding for photo {:?}", photo_uid)))?;

    let mut neighbors: Vec<ImageNeighbor> = store
        .query_nearest_images(&photo.embedding, limit.saturating_add(1))?
        .into_iter()
        .filter(|n| n.photo_uid != photo_uid)
        .collect();
    neighbors.truncate(limit);
    Ok(neighbors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::db::{Album, MemoryStore, SnapshotWriter};

    const DIM: usize = ImageEmbedding::DIM;

    /// Unit vector at `degrees` in the plane of the first two axes.
    fn at_angle(degrees: f32) -> Vec<f32> {
        let r = degrees.to_radians();
        let mut v = vec![0.0; DIM];
        v[0] = r.cos();
        v[1] = r.sin();
        v
    }

    /// Unit vector at `degrees` in the plane of axes `2k` and `2k+1`.
    fn in_plane(k: usize, degrees: f32) -> Vec<f32> {
        let r = degrees.to_radians();
        let mut v = vec![0.0; DIM];
        v[2 * k] = r.cos();
        v[2 * k + 1] = r.sin();
        v
    }

    fn store_with(photos: &[(&str, Vec<f32>)]) -> MemoryStore {
        let store = MemoryStore::new();
        for (uid, v) in photos {
            store.upsert_image_embedding(&image(uid, v.clone())).unwrap();
        }
        store
    }

    fn uids(group: &DuplicateGroup) -> Vec<&str> {
        group.photo_uids.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_chaining_with_literal_distances() {
        // d(P1,P2)=0.05, d(P2,P3)=0.08, d(P1,P3)=0.40
        let d = [[0.0, 0.05, 0.40], [0.05, 0.0, 0.08], [0.40, 0.08, 0.0]];
        let edges = threshold_edges(3, 0.10, |a, b| d[a][b]);
        assert_eq!(edges.len(), 2);
        assert!(!edges.iter().any(|e| e.a == 0 && e.b == 2));

        let components = connected_components(3, &edges);
        assert_eq!(components, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_chaining_end_to_end() {
        // 20 degrees apart is ~0.06 distance; 40 degrees is ~0.23
        let store = store_with(&[
            ("p1", at_angle(0.0)),
            ("p2", at_angle(20.0)),
            ("p3", at_angle(40.0)),
        ]);
        let p1 = at_angle(0.0);
        let p3 = at_angle(40.0);
        assert!(cosine_distance(&p1, &p3) > 0.10);

        for use_index in [true, false] {
            let config = DuplicateConfig {
                use_index,
                ..DuplicateConfig::default()
            };
            let resp = find_duplicates(
                &store,
                &DuplicateRequest::default(),
                &config,
                1000,
                &CancelFlag::new(),
            )
            .unwrap();
            assert_eq!(resp.count, 1);
            assert_eq!(uids(&resp.groups[0]), vec!["p1", "p2", "p3"]);
            assert_eq!(resp.groups[0].distances.len(), 2);
        }
    }

    #[test]
    fn test_two_disjoint_pairs_make_two_groups() {
        let store = store_with(&[
            ("a1", in_plane(0, 0.0)),
            ("a2", in_plane(0, 10.0)),
            ("b1", in_plane(1, 0.0)),
            ("b2", in_plane(1, 10.0)),
            ("solo", in_plane(2, 0.0)),
        ]);
        let resp = find_duplicates(
            &store,
            &DuplicateRequest::default(),
            &DuplicateConfig::default(),
            1000,
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(resp.count, 2);
        assert_eq!(uids(&resp.groups[0]), vec!["a1", "a2"]);
        assert_eq!(uids(&resp.groups[1]), vec!["b1", "b2"]);
        assert_eq!(resp.scanned, 5);
    }

    #[test]
    fn test_pairs_sharing_a_photo_merge() {
        let store = store_with(&[
            ("a", in_plane(0, 0.0)),
            ("b", in_plane(0, 20.0)),
            ("c", in_plane(0, 40.0)),
            ("z", in_plane(3, 0.0)),
        ]);
        let resp = find_duplicates(
            &store,
            &DuplicateRequest::default(),
            &DuplicateConfig::default(),
            1000,
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(resp.count, 1);
        assert_eq!(uids(&resp.groups[0]), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_group_order_and_cap() {
        let store = store_with(&[
            ("c1", in_plane(2, 0.0)),
            ("c2", in_plane(2, 5.0)),
            ("b1", in_plane(1, 0.0)),
            ("b2", in_plane(1, 5.0)),
            ("a1", in_plane(0, 0.0)),
            ("a2", in_plane(0, 5.0)),
            ("a3", in_plane(0, 10.0)),
        ]);
        let request = DuplicateRequest {
            group_limit: Some(2),
            ..DuplicateRequest::default()
        };
        let resp = find_duplicates(
            &store,
            &request,
            &DuplicateConfig::default(),
            1000,
            &CancelFlag::new(),
        )
        .unwrap();
        assert!(resp.truncated);
        assert_eq!(resp.count, 2);
        assert_eq!(uids(&resp.groups[0]), vec!["a1", "a2", "a3"]);
        assert_eq!(uids(&resp.groups[1]), vec!["b1", "b2"]);

        // Stable across runs
        let again = find_duplicates(
            &store,
            &request,
            &DuplicateConfig::default(),
            1000,
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(again.groups, resp.groups);
    }

    #[test]
    fn test_index_edges_match_pairwise_when_saturated() {
        // More within-threshold neighbors than the first index query returns
        let photos: Vec<ImageEmbedding> = (0..40)
            .map(|i| image(&format!("p{:02}", i), at_angle(i as f32 * 0.5)))
            .collect();
        let store = MemoryStore::new();
        for p in &photos {
            store.upsert_image_embedding(p).unwrap();
        }
        let cancel = CancelFlag::new();
        let pairwise = pairwise_edges(&photos, 0.10, &cancel).unwrap();
        let indexed = index_edges(&store, &photos, 0.10, &cancel).unwrap();
        let key = |e: &Edge| (e.a, e.b);
        assert_eq!(
            pairwise.iter().map(key).collect::<Vec<_>>(),
            indexed.iter().map(key).collect::<Vec<_>>()
        );
        assert_eq!(pairwise.len(), 40 * 39 / 2);
    }

    #[test]
    fn test_album_scope() {
        let store = store_with(&[
            ("p1", at_angle(0.0)),
            ("p2", at_angle(1.0)),
            ("p3", at_angle(2.0)),
        ]);
        store
            .replace_albums(&[Album {
                uid: "a1".into(),
                title: "Burst".into(),
                photo_uids: vec!["p1".into(), "p3".into()],
            }])
            .unwrap();
        let request = DuplicateRequest {
            album_uid: Some("a1".into()),
            ..DuplicateRequest::default()
        };
        let resp = find_duplicates(
            &store,
            &request,
            &DuplicateConfig::default(),
            1000,
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(resp.scanned, 2);
        assert_eq!(uids(&resp.groups[0]), vec!["p1", "p3"]);

        let missing = DuplicateRequest {
            album_uid: Some("nope".into()),
            ..DuplicateRequest::default()
        };
        assert!(matches!(
            find_duplicates(&store, &missing, &DuplicateConfig::default(), 1000, &CancelFlag::new()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_cancelled_scan() {
        let store = store_with(&[("p1", at_angle(0.0)), ("p2", at_angle(1.0))]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        for use_index in [true, false] {
            let config = DuplicateConfig {
                use_index,
                ..DuplicateConfig::default()
            };
            assert!(matches!(
                find_duplicates(&store, &DuplicateRequest::default(), &config, 1000, &cancel),
                Err(EngineError::Cancelled)
            ));
        }
    }

    #[test]
    fn test_similar_photos_excludes_self() {
        let store = store_with(&[
            ("p1", at_angle(0.0)),
            ("p2", at_angle(30.0)),
            ("p3", at_angle(10.0)),
        ]);
        let similar = similar_photos(&store, "p1", 5).unwrap();
        let order: Vec<&str> = similar.iter().map(|n| n.photo_uid.as_str()).collect();
        assert_eq!(order, vec!["p3", "p2"]);
        assert_eq!(similar_photos(&store, "p1", 1).unwrap().len(), 1);
        assert!(matches!(
            similar_photos(&store, "zz", 5),
            Err(EngineError::NotFound(_))
        ));
    }
}
