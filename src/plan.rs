//! Maps each scanned image to its destination identity folders.
//!
//! Pure function of the cluster assignment; no I/O happens here.

use std::collections::{BTreeSet, HashMap};

use crate::cluster::{ClusterAssignment, ClusterLabel};
use crate::index::EmbeddingIndex;

/// Destination routing for one source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortPlanEntry {
    /// Discovery index of the image.
    pub image: usize,
    /// Distinct non-noise cluster labels among the image's faces, sorted.
    pub labels: Vec<ClusterLabel>,
    /// Route to the unsorted bucket. Set only when no recognized face
    /// exists in the image; a noise face next to a recognized one does
    /// not send the image to unsorted.
    pub unsorted: bool,
}

/// Build one plan entry per scanned image, in discovery order.
///
/// `scanned` lists the discovery indices of every image that completed
/// decode and detection; each gets exactly one entry. Images whose faces
/// landed in several clusters route to every matching folder.
pub fn build_plan(
    scanned: &[usize],
    index: &EmbeddingIndex,
    assignment: &ClusterAssignment,
) -> Vec<SortPlanEntry> {
    let mut labels_by_image: HashMap<usize, BTreeSet<ClusterLabel>> = HashMap::new();
    for (observation, label) in index.iter().zip(assignment.labels.iter()) {
        if let Some(label) = label {
            labels_by_image
                .entry(observation.image)
                .or_default()
                .insert(*label);
        }
    }

    scanned
        .iter()
        .map(|&image| {
            let labels: Vec<ClusterLabel> = labels_by_image
                .get(&image)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            SortPlanEntry {
                image,
                unsorted: labels.is_empty(),
                labels,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BoundingBox, FaceObservation};

    fn observation(image: usize) -> FaceObservation {
        FaceObservation {
            image,
            bbox: BoundingBox {
                x: 0,
                y: 0,
                width: 10,
                height: 10,
            },
            embedding: vec![0.0],
            confidence: 1.0,
        }
    }

    fn assignment(labels: Vec<Option<usize>>) -> ClusterAssignment {
        ClusterAssignment {
            labels,
            clusters: Vec::new(),
        }
    }

    #[test]
    fn test_every_scanned_image_gets_exactly_one_entry() {
        let mut index = EmbeddingIndex::new();
        index.push(observation(0));
        index.push(observation(2));

        let plan = build_plan(
            &[0, 1, 2],
            &index,
            &assignment(vec![Some(0), Some(1)]),
        );
        assert_eq!(plan.len(), 3);
        let images: Vec<usize> = plan.iter().map(|e| e.image).collect();
        assert_eq!(images, vec![0, 1, 2]);
    }

    #[test]
    fn test_group_photo_routes_to_every_identity() {
        let mut index = EmbeddingIndex::new();
        index.push(observation(0));
        index.push(observation(0));

        let plan = build_plan(&[0], &index, &assignment(vec![Some(3), Some(1)]));
        assert_eq!(plan[0].labels, vec![1, 3]);
        assert!(!plan[0].unsorted);
    }

    #[test]
    fn test_duplicate_labels_collapse_within_an_image() {
        let mut index = EmbeddingIndex::new();
        index.push(observation(0));
        index.push(observation(0));

        let plan = build_plan(&[0], &index, &assignment(vec![Some(2), Some(2)]));
        assert_eq!(plan[0].labels, vec![2]);
    }

    #[test]
    fn test_zero_faces_routes_to_unsorted() {
        let index = EmbeddingIndex::new();
        let plan = build_plan(&[0], &index, &assignment(vec![]));
        assert!(plan[0].unsorted);
        assert!(plan[0].labels.is_empty());
    }

    #[test]
    fn test_all_noise_faces_route_to_unsorted() {
        let mut index = EmbeddingIndex::new();
        index.push(observation(0));
        index.push(observation(0));

        let plan = build_plan(&[0], &index, &assignment(vec![None, None]));
        assert!(plan[0].unsorted);
    }

    #[test]
    fn test_noise_face_beside_recognized_face_does_not_route_to_unsorted() {
        let mut index = EmbeddingIndex::new();
        index.push(observation(0));
        index.push(observation(0));

        let plan = build_plan(&[0], &index, &assignment(vec![Some(0), None]));
        assert_eq!(plan[0].labels, vec![0]);
        assert!(!plan[0].unsorted);
    }
}
