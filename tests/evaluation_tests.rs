mod commons;
use commons::*;

use approx::assert_relative_eq;
use hsne_rs::prelude::*;

/// Test 1: Precision and recall of a t-SNE embedding
#[test]
fn evaluation_integration_01_precision_recall() {
    init_logging();
    let (data, _) = create_diagnostic_data(40, 5, 11);
    let embedding = tsne(
        data.as_ref(),
        10.0,
        TsneParams {
            seed: 11,
            ..TsneParams::default()
        },
        500,
        "exact",
        &NearestNeighbourParams::default(),
        false,
    )
    .unwrap();

    let points: Vec<usize> = (0..200).step_by(3).collect();
    let k = 10;
    let (precision, recall) =
        compute_precision_recall(data.as_ref(), &embedding, &points, k).unwrap();

    println!("\n=== Evaluation 1: precision / recall ===");
    for j in 0..k {
        println!(
            "k' = {:2}: precision {:.3}, recall {:.3}",
            j + 1,
            precision[j],
            recall[j]
        );
    }

    assert_eq!(precision.len(), k);
    assert_eq!(recall.len(), k);
    assert!(precision.iter().chain(&recall).all(|&v| (0.0..=1.0).contains(&v)));
    assert!(
        recall.windows(2).all(|w| w[0] <= w[1] + 1e-12),
        "Recall never decreases with k'"
    );
    // at k' = k precision and recall share the numerator and denominator
    assert_relative_eq!(precision[k - 1], recall[k - 1], epsilon = 1e-12);
    // random layouts would score k / n
    assert!(recall[k - 1] > 0.2);
}

/// Test 2: Precision and recall of the landmarks of a coarse scale
#[test]
fn evaluation_integration_02_landmark_mapping() {
    let (data, _) = create_diagnostic_data(60, 5, 42);
    let mut hsne = HierarchicalSne::new();
    hsne.initialize(data.as_ref(), diagnostic_hsne_params(42))
        .unwrap();
    hsne.add_scale().unwrap();

    let n_landmarks = hsne.scale(1).unwrap().size();
    let embedding = embed_scale(
        &hsne,
        1,
        TsneParams {
            seed: 42,
            ..TsneParams::default()
        },
        300,
    )
    .unwrap();
    let mapping = hsne.scale(1).unwrap().landmark_to_original_data_idx.clone();

    let points: Vec<usize> = (0..n_landmarks).collect();
    let (precision, recall) =
        compute_precision_recall_with_mapping(data.as_ref(), &embedding, &points, &mapping, 5)
            .unwrap();
    println!(
        "Landmark precision@5 {:.3}, recall@5 {:.3}",
        precision[4], recall[4]
    );
    assert!(precision.iter().all(|v| v.is_finite()));

    // the mapping must cover the embedding
    assert!(matches!(
        compute_precision_recall_with_mapping(data.as_ref(), &embedding, &points, &mapping[1..], 5),
        Err(HsneError::InvalidArgument(_))
    ));
}
