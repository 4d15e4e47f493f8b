//! Integration tests: trace a sub-sampled observation grid onto a small source
//! lattice, blur the mapping with a PSF, synthesize images from a known source,
//! and check that the inversion recovers it.

use approx::{assert_abs_diff_eq, assert_relative_eq};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use pixinv::{
    create_covariance_matrix, curvature_matrix, curvature_matrix_via_covariances,
    inversion_from_mapping, AdjacencyGraph, Convolver, CovarianceConfig, CurvatureMethod,
    InversionConfig, InversionError, MappingMatrix, MatrixKind, NoBlur, Regularization,
};

const OBS_SIDE: usize = 8;
const SUB: usize = 2;
const SRC_SIDE: usize = 4;

/// Separable `[1, 2, 1] / 4` kernel on the observation grid, clipped at the edges.
struct BinomialBlur {
    side: usize,
}

impl Convolver for BinomialBlur {
    fn convolve_mapping_matrix(&self, mapping: &MappingMatrix) -> MappingMatrix {
        const KERNEL: [f64; 3] = [0.25, 0.5, 0.25];
        let side = self.side;
        let m = mapping.matrix();
        let blurred = DMatrix::from_fn(m.nrows(), m.ncols(), |r, o| {
            let (oy, ox) = ((o / side) as isize, (o % side) as isize);
            let mut sum = 0.0;
            for (ky, wy) in KERNEL.iter().enumerate() {
                for (kx, wx) in KERNEL.iter().enumerate() {
                    let (y, x) = (oy + ky as isize - 1, ox + kx as isize - 1);
                    if y < 0 || x < 0 || y >= side as isize || x >= side as isize {
                        continue;
                    }
                    sum += wy * wx * m[(r, y as usize * side + x as usize)];
                }
            }
            sum
        });
        MappingMatrix::from_matrix(blurred)
    }
}

/// Every observation pixel is split into `SUB × SUB` sub-pixels. The source
/// lattice is shifted by one sub-pixel, so border observation pixels straddle
/// two source pixels.
fn traced_sub_grid() -> (Vec<usize>, Vec<usize>) {
    let fine_side = OBS_SIDE * SUB;
    let source_cell = fine_side / SRC_SIDE;
    let mut sub_to_source = Vec::new();
    let mut sub_to_obs = Vec::new();
    for oy in 0..OBS_SIDE {
        for ox in 0..OBS_SIDE {
            for sy in 0..SUB {
                for sx in 0..SUB {
                    let (fy, fx) = (oy * SUB + sy, ox * SUB + sx);
                    let py = ((fy + 1) / source_cell).min(SRC_SIDE - 1);
                    let px = ((fx + 1) / source_cell).min(SRC_SIDE - 1);
                    sub_to_source.push(py * SRC_SIDE + px);
                    sub_to_obs.push(oy * OBS_SIDE + ox);
                }
            }
        }
    }
    (sub_to_source, sub_to_obs)
}

fn traced_mapping() -> MappingMatrix {
    let (sub_to_source, sub_to_obs) = traced_sub_grid();
    MappingMatrix::from_sub_grid(SRC_SIDE * SRC_SIDE, OBS_SIDE * OBS_SIDE, SUB, &sub_to_source, &sub_to_obs)
        .expect("valid sub-grid")
}

/// Smooth Gaussian blob on the source lattice.
fn true_source() -> DVector<f64> {
    DVector::from_fn(SRC_SIDE * SRC_SIDE, |i, _| {
        let (y, x) = ((i / SRC_SIDE) as f64, (i % SRC_SIDE) as f64);
        let r2 = (y - 1.5).powi(2) + (x - 1.2).powi(2);
        0.2 + (-r2 / 2.0).exp()
    })
}

fn no_regularization() -> Regularization {
    Regularization::Constant {
        coefficient: 0.0,
        diagonal_floor: 0.0,
    }
}

#[test]
fn test_noiseless_round_trip_recovers_source() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();

    let mapping = traced_mapping();
    let blur = BinomialBlur { side: OBS_SIDE };
    let blurred = blur.convolve_mapping_matrix(&mapping);
    let source = true_source();
    let image: Vec<f64> = blurred.matrix().tr_mul(&source).iter().copied().collect();
    let noise = vec![0.05; image.len()];
    let graph = AdjacencyGraph::rectangular(SRC_SIDE, SRC_SIDE);

    let inversion = inversion_from_mapping(
        &image,
        &noise,
        &blur,
        &mapping,
        &graph,
        &no_regularization(),
        None,
        &InversionConfig::default(),
    )
    .expect("inversion should succeed");

    for i in 0..source.len() {
        assert_abs_diff_eq!(inversion.solution()[i], source[i], epsilon = 1e-8);
    }
    let model = inversion.reconstructed_data_vector();
    for (m, v) in model.iter().zip(&image) {
        assert_abs_diff_eq!(*m, *v, epsilon = 1e-8);
    }
    assert!(inversion.chi_squared(&image, &noise).unwrap() < 1e-6);
    assert_eq!(inversion.regularization_term(), 0.0);
}

#[test]
fn test_graph_search_matches_dense_curvature() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();

    let mapping = traced_mapping();
    let blurred = BinomialBlur { side: OBS_SIDE }.convolve_mapping_matrix(&mapping);
    let graph = AdjacencyGraph::rectangular(SRC_SIDE, SRC_SIDE);

    // Varying noise so the per-observation weighting matters.
    let noise: Vec<f64> = (0..OBS_SIDE * OBS_SIDE)
        .map(|o| 0.05 + 0.01 * (o % 7) as f64)
        .collect();

    let dense = curvature_matrix(&blurred, &noise).unwrap();
    let searched =
        curvature_matrix_via_covariances(&blurred, &noise, &graph, &CovarianceConfig::default())
            .unwrap();

    assert_relative_eq!(dense, searched, epsilon = 1e-9, max_relative = 1e-12);
    // The blur spreads each source pixel over neighbouring source cells, so
    // the matrix is banded but not diagonal.
    assert!(dense[(0, 1)] > 0.0);
    assert!(dense[(0, 5)] > 0.0);
    assert_eq!(dense[(0, 15)], 0.0);
}

#[test]
fn test_both_curvature_paths_give_same_inversion() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let mapping = traced_mapping();
    let blur = BinomialBlur { side: OBS_SIDE };
    let source = true_source();
    let clean = blur.convolve_mapping_matrix(&mapping).matrix().tr_mul(&source);

    let sigma = 0.05;
    let mut rng = StdRng::seed_from_u64(42);
    let normal = Normal::new(0.0, sigma).unwrap();
    let image: Vec<f64> = clean.iter().map(|v| v + normal.sample(&mut rng)).collect();
    let noise = vec![sigma; image.len()];
    let graph = AdjacencyGraph::rectangular(SRC_SIDE, SRC_SIDE);
    let regularization = Regularization::constant(2.0);

    let solve = |curvature: CurvatureMethod| {
        let config = InversionConfig {
            curvature,
            ..Default::default()
        };
        inversion_from_mapping(&image, &noise, &blur, &mapping, &graph, &regularization, None, &config)
            .expect("inversion should succeed")
    };
    let dense = solve(CurvatureMethod::Dense);
    let searched = solve(CurvatureMethod::Covariance);

    assert_relative_eq!(dense.solution(), searched.solution(), epsilon = 1e-8);
    assert_relative_eq!(
        dense.evidence(&image, &noise).unwrap(),
        searched.evidence(&image, &noise).unwrap(),
        epsilon = 1e-6
    );

    // A regularized fit of a noisy image still sits close to the truth.
    for i in 0..source.len() {
        assert!(
            (dense.solution()[i] - source[i]).abs() < 0.2,
            "pixel {i}: {} vs {}",
            dense.solution()[i],
            source[i]
        );
    }
}

#[test]
fn test_evidence_prefers_moderate_regularization() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let mapping = traced_mapping();
    let blur = BinomialBlur { side: OBS_SIDE };
    let clean = blur
        .convolve_mapping_matrix(&mapping)
        .matrix()
        .tr_mul(&true_source());

    let sigma = 0.05;
    let mut rng = StdRng::seed_from_u64(7);
    let normal = Normal::new(0.0, sigma).unwrap();
    let image: Vec<f64> = clean.iter().map(|v| v + normal.sample(&mut rng)).collect();
    let noise = vec![sigma; image.len()];
    let graph = AdjacencyGraph::rectangular(SRC_SIDE, SRC_SIDE);

    let evidence = |regularization: Regularization| {
        inversion_from_mapping(
            &image,
            &noise,
            &blur,
            &mapping,
            &graph,
            &regularization,
            None,
            &InversionConfig::default(),
        )
        .and_then(|inv| inv.evidence(&image, &noise))
        .expect("evidence should be defined")
    };

    let moderate = evidence(Regularization::constant(1.0));
    let oversmoothed = evidence(Regularization::constant(1.0e2));
    println!("evidence: moderate {moderate:.3}, oversmoothed {oversmoothed:.3}");
    assert!(moderate.is_finite());
    assert!(moderate > oversmoothed);

    // Weighted scheme: heavier smoothing in the faint background.
    let signals: Vec<f64> = true_source().iter().map(|v| (v - 0.2).clamp(0.0, 1.0)).collect();
    let inversion = inversion_from_mapping(
        &image,
        &noise,
        &blur,
        &mapping,
        &graph,
        &Regularization::weighted(0.5, 4.0),
        Some(&signals),
        &InversionConfig::default(),
    )
    .unwrap();
    assert!(inversion.evidence(&image, &noise).unwrap().is_finite());
    assert!(inversion.regularization_term() > 0.0);
}

#[test]
fn test_under_determined_without_regularization_fails() {
    // Four source pixels seen through a single observation pixel: F is all ones.
    let mapping = MappingMatrix::from_sub_grid(4, 1, 2, &[0, 1, 2, 3], &[0, 0, 0, 0]).unwrap();
    let graph = AdjacencyGraph::rectangular(2, 2);
    let err = inversion_from_mapping(
        &[1.0],
        &[0.25],
        &NoBlur,
        &mapping,
        &graph,
        &no_regularization(),
        None,
        &InversionConfig::default(),
    )
    .unwrap_err();
    assert_eq!(
        err,
        InversionError::NotPositiveDefinite {
            matrix: MatrixKind::CurvatureReg
        }
    );
}

#[test]
fn test_weighted_scheme_requires_signals() {
    let mapping = traced_mapping();
    let graph = AdjacencyGraph::rectangular(SRC_SIDE, SRC_SIDE);
    let image = vec![1.0; OBS_SIDE * OBS_SIDE];
    let noise = vec![0.1; OBS_SIDE * OBS_SIDE];
    let err = inversion_from_mapping(
        &image,
        &noise,
        &NoBlur,
        &mapping,
        &graph,
        &Regularization::weighted(1.0, 2.0),
        None,
        &InversionConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, InversionError::LengthMismatch { what: "pixel signals", .. }));
}

#[test]
fn test_covariance_map_is_sparse_and_symmetric() {
    let mapping = traced_mapping();
    let blurred = BinomialBlur { side: OBS_SIDE }.convolve_mapping_matrix(&mapping);
    let maps = blurred.contribution_maps();
    let variance = vec![0.01; OBS_SIDE * OBS_SIDE];
    let graph = AdjacencyGraph::rectangular(SRC_SIDE, SRC_SIDE);

    let covariances = create_covariance_matrix(&maps, &variance, &graph, &CovarianceConfig::default()).unwrap();
    let pixels = SRC_SIDE * SRC_SIDE;
    assert!(covariances.len() < pixels * (pixels + 1) / 2);
    for i in 0..pixels {
        assert!(covariances.contains(i, i));
        for j in 0..pixels {
            assert_eq!(covariances.get(i, j), covariances.get(j, i));
        }
    }
}

#[cfg(feature = "parallel")]
#[test]
fn test_parallel_search_matches_serial() {
    use pixinv::CovarianceMatrixGenerator;

    let mapping = traced_mapping();
    let blurred = BinomialBlur { side: OBS_SIDE }.convolve_mapping_matrix(&mapping);
    let maps = blurred.contribution_maps();
    let variance: Vec<f64> = (0..OBS_SIDE * OBS_SIDE).map(|o| 0.01 + 1e-3 * o as f64).collect();
    let graph = AdjacencyGraph::rectangular(SRC_SIDE, SRC_SIDE);
    let config = CovarianceConfig::default();

    let mut serial = CovarianceMatrixGenerator::new(&maps, &variance, &graph, &config).unwrap();
    serial.find_all_contiguous_covariances();
    let mut parallel = CovarianceMatrixGenerator::new(&maps, &variance, &graph, &config).unwrap();
    parallel.find_all_contiguous_covariances_parallel();

    assert_eq!(serial.covariances(), parallel.covariances());
    for seed in 0..graph.pixels() {
        assert_eq!(serial.neighbour_list(seed), parallel.neighbour_list(seed));
    }
}
