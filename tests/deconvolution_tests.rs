// In tests/deconvolution_tests.rs
//
// End-to-end scenario: a synthetic three-component methylation mixture is
// factorized over a range of candidate component counts, the bootstrap
// deviance procedure picks K, and the chosen mixing matrix is projected
// against a larger feature set.

use cellmix::{
    bootstrap_deviance, fit_array, project, select_k, svd_initial_factor, InitialFactor,
};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Dirichlet, Distribution, Normal};

const TRUE_K: usize = 3;

/// Well-separated block signatures: each component is highly methylated on
/// its own third of the sites and lowly methylated elsewhere.
fn true_signatures(n_features: usize) -> Array2<f64> {
    Array2::from_shape_fn((n_features, TRUE_K), |(feature, component)| {
        if feature % TRUE_K == component {
            0.85
        } else {
            0.1
        }
    })
}

fn true_mixing(n_samples: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let dirichlet = Dirichlet::new(&vec![1.0; TRUE_K]).unwrap();
    let mut omega = Array2::zeros((n_samples, TRUE_K));
    for mut row in omega.rows_mut() {
        let draw = dirichlet.sample(rng);
        for (target, value) in row.iter_mut().zip(draw) {
            *target = value;
        }
    }
    omega
}

fn noisy_mixture(
    mu: &Array2<f64>,
    omega: &Array2<f64>,
    noise_sd: f64,
    rng: &mut ChaCha8Rng,
) -> Array2<f64> {
    let noise = Normal::new(0.0, noise_sd).unwrap();
    let mut y = mu.dot(&omega.t());
    y.mapv_inplace(|v| (v + noise.sample(rng)).clamp(0.001, 0.999));
    y
}

/// Runs the whole pipeline once and returns the selected component count.
fn run_pipeline(seed: u64) -> usize {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mu_true = true_signatures(100);
    let omega_true = true_mixing(20, &mut rng);
    let y = noisy_mixture(&mu_true, &omega_true, 0.02, &mut rng);

    let ks: Vec<usize> = (1..=5).collect();
    let initial = svd_initial_factor(y.view(), 5).unwrap();
    let models = fit_array(y.view(), &ks, InitialFactor::Signatures(initial.view()), 25).unwrap();

    let table = bootstrap_deviance(&models, y.view(), 30, 2, Some(seed)).unwrap();
    select_k(&table, 0.25).unwrap()
}

#[test]
fn bootstrap_selection_recovers_true_component_count() {
    let seeds = [11u64, 23, 47];
    let hits = seeds
        .iter()
        .filter(|&&seed| run_pipeline(seed) == TRUE_K)
        .count();
    assert!(
        hits >= 2,
        "expected the true K={} in at least 2 of {} seeded trials, got {}",
        TRUE_K,
        seeds.len(),
        hits
    );
}

#[test]
fn reference_deviance_drops_sharply_at_the_true_component_count() {
    let mut rng = ChaCha8Rng::seed_from_u64(101);
    let mu_true = true_signatures(100);
    let omega_true = true_mixing(20, &mut rng);
    let y = noisy_mixture(&mu_true, &omega_true, 0.02, &mut rng);

    let ks: Vec<usize> = (1..=5).collect();
    let initial = svd_initial_factor(y.view(), 5).unwrap();
    let models = fit_array(y.view(), &ks, InitialFactor::Signatures(initial.view()), 25).unwrap();
    let table = bootstrap_deviance(&models, y.view(), 5, 1, Some(101)).unwrap();

    let reference = table.values();
    let dev_k1 = reference[[0, 0]];
    let dev_k2 = reference[[0, 1]];
    let dev_k3 = reference[[0, 2]];
    assert!(
        dev_k1 > dev_k2 && dev_k2 > dev_k3,
        "reference deviance should fall while real structure remains: {} / {} / {}",
        dev_k1,
        dev_k2,
        dev_k3
    );
    assert!(
        dev_k1 > 2.0 * dev_k3,
        "three real components should explain far more than one: {} vs {}",
        dev_k1,
        dev_k3
    );
}

#[test]
fn chosen_model_projects_onto_the_full_feature_set() {
    let mut rng = ChaCha8Rng::seed_from_u64(211);
    let mu_reduced_true = true_signatures(100);
    let omega_true = true_mixing(20, &mut rng);
    let y_reduced = noisy_mixture(&mu_reduced_true, &omega_true, 0.02, &mut rng);

    // The "full" matrix: ten times the features, same samples, same order.
    let mu_full_true = true_signatures(1000);
    let y_full = noisy_mixture(&mu_full_true, &omega_true, 0.02, &mut rng);

    let initial = svd_initial_factor(y_reduced.view(), TRUE_K).unwrap();
    let models = fit_array(
        y_reduced.view(),
        &[TRUE_K],
        InitialFactor::Signatures(initial.view()),
        25,
    )
    .unwrap();
    let chosen = &models[&TRUE_K];

    let mu_full = project(y_full.view(), chosen.omega.view()).unwrap();
    assert_eq!(mu_full.dim(), (1000, TRUE_K));

    // The projected signatures must reconstruct the full matrix about as
    // well as the generating noise level allows.
    let reconstruction = mu_full.dot(&chosen.omega.t());
    let mean_absolute_error = (&reconstruction - &y_full).mapv(f64::abs).mean().unwrap();
    assert!(
        mean_absolute_error < 0.05,
        "projected reconstruction error too large: {}",
        mean_absolute_error
    );
}
